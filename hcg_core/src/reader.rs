use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::PixelCodec;
use crate::error::{HcgError, Result};
use crate::format::{
    parse_comment_length, IndexBlock, IndexCopy, IndexEntry, BOUNDARY_MARKER, COMMENT_LENGTH_SIZE,
    FOOTER_SIZE, MAGIC, NULL_REF, PREAMBLE_SIZE,
};
use crate::image::{Image, ImageId, ImageSource};

/// Which index copy the reader enumerates images from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexChoice {
    /// Head copy, falling back to the tail copy if the head fails
    /// validation.
    #[default]
    Auto,
    Head,
    Tail,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub index: IndexChoice,
}

/// Reader for HCG001 archives.
///
/// # Open sequence
/// 1. Read the magic and the comment header; the head index starts right
///    after the comment.
/// 2. Load one index copy (see [`IndexChoice`]): read the declared length,
///    the entry bytes and the CRC-32, and verify the checksum. For the tail
///    copy the footer gives the block offset and the eight bytes before it
///    must be the zero boundary marker.
/// 3. Parse the entries, mapping each record's own offset to its image, and
///    resolve `ref_pointer`s in a second pass so forward references work.
///
/// Payloads are fetched lazily from the stream. The stream sits behind a
/// mutex; concurrent extraction from one reader is serialized.
pub struct ArchiveReader<R = BufReader<File>> {
    stream: Mutex<R>,
    stream_len: u64,
    comment: Vec<u8>,
    head_index_offset: u64,
    images: Vec<Image>,
    by_key: HashMap<String, ImageId>,
    loaded_from: IndexCopy,
    codec: Arc<dyn PixelCodec>,
}

impl ArchiveReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, codec: Arc<dyn PixelCodec>) -> Result<Self> {
        Self::open_with(path, codec, ReadOptions::default())
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        codec: Arc<dyn PixelCodec>,
        options: ReadOptions,
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_stream(BufReader::new(file), codec, options)
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn from_stream(
        mut stream: R,
        codec: Arc<dyn PixelCodec>,
        options: ReadOptions,
    ) -> Result<Self> {
        let stream_len = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;

        // ── Magic + comment ────────────────────────────────────────────────
        let mut magic = [0u8; 8];
        read_header_field(&mut stream, &mut magic, "magic")?;
        if &magic != MAGIC {
            return Err(HcgError::Format("bad magic bytes, not an HCG001 archive".into()));
        }
        let mut length_field = [0u8; COMMENT_LENGTH_SIZE as usize];
        read_header_field(&mut stream, &mut length_field, "comment length")?;
        let comment_len = parse_comment_length(&length_field)?;
        if PREAMBLE_SIZE + comment_len as u64 > stream_len {
            return Err(HcgError::Format(format!(
                "comment of {} bytes runs past the end of the archive",
                comment_len
            )));
        }
        let mut comment = vec![0u8; comment_len];
        read_header_field(&mut stream, &mut comment, "comment")?;

        let mut reader = Self {
            stream: Mutex::new(stream),
            stream_len,
            comment,
            head_index_offset: PREAMBLE_SIZE + comment_len as u64,
            images: Vec::new(),
            by_key: HashMap::new(),
            loaded_from: IndexCopy::Head,
            codec,
        };

        // ── Index ──────────────────────────────────────────────────────────
        let (copy, images) = match options.index {
            IndexChoice::Head => (IndexCopy::Head, reader.load_images(IndexCopy::Head)?),
            IndexChoice::Tail => (IndexCopy::Tail, reader.load_images(IndexCopy::Tail)?),
            IndexChoice::Auto => match reader.load_images(IndexCopy::Head) {
                Ok(images) => (IndexCopy::Head, images),
                Err(head) => {
                    warn!(error = %head, "head index rejected, trying the tail copy");
                    match reader.load_images(IndexCopy::Tail) {
                        Ok(images) => (IndexCopy::Tail, images),
                        Err(tail) => {
                            return Err(HcgError::Unreadable {
                                head: Box::new(head),
                                tail: Box::new(tail),
                            })
                        }
                    }
                }
            },
        };

        reader.by_key = images
            .iter()
            .enumerate()
            .map(|(i, image)| (image.key().to_string(), ImageId(i)))
            .collect();
        reader.images = images;
        reader.loaded_from = copy;
        debug!(images = reader.images.len(), index = %copy, "opened archive");
        Ok(reader)
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Absolute offset of the head index block.
    pub fn head_index_offset(&self) -> u64 {
        self.head_index_offset
    }

    /// The index copy images were enumerated from.
    pub fn loaded_from(&self) -> IndexCopy {
        self.loaded_from
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Image> {
        self.by_key.get(key).map(|id| &self.images[id.0])
    }

    /// Absolute offset of the tail index block, read from the footer.
    pub fn tail_index_offset(&self) -> Result<u64> {
        let mut stream = self.stream.lock();
        self.read_tail_offset(&mut stream)
    }

    pub fn validate_head_index(&self) -> Result<()> {
        self.read_index(IndexCopy::Head).map(|_| ())
    }

    pub fn validate_tail_index(&self) -> Result<()> {
        self.read_index(IndexCopy::Tail).map(|_| ())
    }

    /// Raw entries of one index copy with their record offsets, after
    /// validation.
    pub fn index_entries(&self, copy: IndexCopy) -> Result<Vec<(u64, IndexEntry)>> {
        self.read_index(copy)?.parse()
    }

    fn read_tail_offset(&self, stream: &mut R) -> Result<u64> {
        let min_len = self.head_index_offset + FOOTER_SIZE;
        if self.stream_len < min_len {
            return Err(HcgError::Format(format!(
                "archive of {} bytes is too short to hold a footer",
                self.stream_len
            )));
        }
        stream.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; 8];
        stream.read_exact(&mut footer)?;
        Ok(u64::from_le_bytes(footer))
    }

    /// Read and checksum one index block.
    fn read_index(&self, copy: IndexCopy) -> Result<IndexBlock> {
        let mut stream = self.stream.lock();
        let start = match copy {
            IndexCopy::Head => self.head_index_offset,
            IndexCopy::Tail => {
                let start = self.read_tail_offset(&mut stream)?;
                let marker_at = start.checked_sub(BOUNDARY_MARKER.len() as u64);
                let marker_at = match marker_at {
                    Some(at) if at >= self.head_index_offset && start <= self.stream_len => at,
                    _ => {
                        return Err(HcgError::Format(format!(
                            "footer points the tail index at offset {}, outside the archive",
                            start
                        )))
                    }
                };
                stream.seek(SeekFrom::Start(marker_at))?;
                let mut marker = [0u8; 8];
                stream.read_exact(&mut marker)?;
                if marker != BOUNDARY_MARKER {
                    return Err(HcgError::BoundaryMarker {
                        offset: marker_at,
                        found: marker,
                    });
                }
                start
            }
        };
        let block = IndexBlock::read_from(&mut *stream, start, self.stream_len, copy)?;
        block.verify(copy)?;
        Ok(block)
    }

    /// Enumerate images from one index copy.
    fn load_images(&self, copy: IndexCopy) -> Result<Vec<Image>> {
        let entries = self.read_index(copy)?.parse()?;

        let mut at_offset: HashMap<u64, ImageId> = HashMap::with_capacity(entries.len());
        let mut keys: HashSet<&str> = HashSet::with_capacity(entries.len());
        for (i, (record_offset, entry)) in entries.iter().enumerate() {
            if !keys.insert(entry.key.as_str()) {
                return Err(HcgError::Format(format!(
                    "{} index lists key {:?} twice",
                    copy, entry.key
                )));
            }
            let end = entry.data_offset.checked_add(u64::from(entry.payload_size));
            if end.map_or(true, |end| end > self.stream_len) {
                return Err(HcgError::Format(format!(
                    "payload of {:?} at offset {} runs past the end of the archive",
                    entry.key, entry.data_offset
                )));
            }
            at_offset.insert(*record_offset, ImageId(i));
        }

        // Second pass: ref_pointers may point forward.
        let mut references = Vec::with_capacity(entries.len());
        for (_, entry) in &entries {
            let reference = match entry.ref_pointer {
                NULL_REF => None,
                pointer => Some(*at_offset.get(&pointer).ok_or_else(|| {
                    HcgError::Format(format!(
                        "{:?} references offset {}, which is not an entry of the {} index",
                        entry.key, pointer, copy
                    ))
                })?),
            };
            references.push(reference);
        }
        for (i, reference) in references.iter().enumerate() {
            if let Some(target) = reference {
                if target.0 == i || references[target.0].is_some() {
                    return Err(HcgError::Format(format!(
                        "{:?} references an image that is not self-contained",
                        entries[i].1.key
                    )));
                }
            }
        }

        Ok(entries
            .into_iter()
            .zip(references)
            .map(|((_, entry), reference)| {
                Image::stored(
                    entry.key,
                    entry.data_offset,
                    entry.payload_size,
                    entry.checksum,
                    reference,
                )
            })
            .collect())
    }
}

impl<R: Read + Seek> ImageSource for ArchiveReader<R> {
    fn images(&self) -> &[Image] {
        &self.images
    }

    fn codec(&self) -> &dyn PixelCodec {
        self.codec.as_ref()
    }

    fn read_stored(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock();
        stream.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn lookup(&self, key: &str) -> Option<ImageId> {
        self.by_key.get(key).copied()
    }
}

fn read_header_field<R: Read>(stream: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            HcgError::Format(format!("truncated header: missing {}", what))
        }
        _ => HcgError::Io(e),
    })
}
