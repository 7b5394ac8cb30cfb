use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{HcgError, Result};
use crate::format::{
    checksum, encode_preamble, IndexBlock, IndexEntry, BOUNDARY_MARKER, DEFAULT_COMMENT,
    ENTRY_FIXED_SIZE, FOOTER_SIZE, INDEX_LENGTH_SIZE, NULL_REF,
};
use crate::image::{key_order, ImageId, ImageSource};

/// What [`ArchiveWriter::write`] produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub images: usize,
    pub deltas: usize,
    /// Bytes in the data heap.
    pub data_bytes: u64,
    /// Bytes in the whole archive.
    pub total_bytes: u64,
    pub head_index_offset: u64,
    pub tail_index_offset: u64,
}

/// Where one image lands: its record inside an index block and its
/// payload inside the data heap, both relative.
struct Slot {
    id: ImageId,
    record: u64,
    heap: u64,
}

/// Writer for HCG001 archives.
///
/// # Format layout written
/// ```text
/// [MAGIC: "HCG001\r\n"] [COMMENT LENGTH: "%06x\r\n"] [COMMENT]
/// [HEAD INDEX: len:u64, entries, crc32:u32]
/// [DATA HEAP: every stored payload, in archive order]
/// [BOUNDARY: 8 zero bytes]
/// [TAIL INDEX: len:u64, entries, crc32:u32]   ← ref_pointers re-pointed
/// [FOOTER: u64 LE offset of the tail index]
/// ```
/// Every offset is known before the first byte is written, so the archive
/// is produced in one forward pass.
pub struct ArchiveWriter<W: Write = BufWriter<File>> {
    out: W,
    comment: Vec<u8>,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create a new archive at `path`, overwriting any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            comment: DEFAULT_COMMENT.as_bytes().to_vec(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<Vec<u8>>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Serialize every image of `src` in archive order and flush.
    ///
    /// Each payload is checked against its recorded checksum while being
    /// copied, so repacking a damaged archive fails instead of sealing bad
    /// bytes under a fresh index.
    pub fn write<S>(mut self, src: &S) -> Result<WriteSummary>
    where
        S: ImageSource + ?Sized,
    {
        let images = src.images();
        let mut order: Vec<ImageId> = (0..images.len()).map(ImageId).collect();
        order.sort_by(|a, b| key_order(images[a.0].key(), images[b.0].key()));

        // ── Layout ─────────────────────────────────────────────────────────
        let mut slots = Vec::with_capacity(order.len());
        let mut position: HashMap<ImageId, usize> = HashMap::with_capacity(order.len());
        let (mut entries_len, mut data_len) = (0u64, 0u64);
        for id in order {
            let image = src.image(id)?;
            position.insert(id, slots.len());
            slots.push(Slot {
                id,
                record: entries_len,
                heap: data_len,
            });
            entries_len += (ENTRY_FIXED_SIZE + image.key().len()) as u64;
            data_len += u64::from(image.size());
        }
        for slot in &slots {
            if let Some(reference) = src.image(slot.id)?.reference() {
                if !position.contains_key(&reference) || src.image(reference)?.is_delta() {
                    return Err(HcgError::InvalidReference(format!(
                        "{:?} must reference a self-contained image of the same archive",
                        src.image(slot.id)?.key()
                    )));
                }
            }
        }

        let preamble = encode_preamble(&self.comment)?;
        let head_start = preamble.len() as u64;
        let data_start = head_start + IndexBlock::encoded_len(entries_len);
        let tail_start = data_start + data_len + BOUNDARY_MARKER.len() as u64;
        debug!(
            images = slots.len(),
            head_start = head_start,
            data_start = data_start,
            tail_start = tail_start,
            "archive layout"
        );

        // ── Head index ─────────────────────────────────────────────────────
        let head = encode_entries(src, &slots, &position, head_start, data_start)?;
        self.out.write_all(&preamble)?;
        self.out.write_all(&IndexBlock::encode(&head))?;

        // ── Data heap ──────────────────────────────────────────────────────
        let mut deltas = 0;
        for slot in &slots {
            let image = src.image(slot.id)?;
            let bytes = image.stored_bytes(src)?;
            if bytes.len() as u64 != u64::from(image.size()) {
                return Err(HcgError::Format(format!(
                    "payload of {:?} is {} bytes but its entry says {}",
                    image.key(),
                    bytes.len(),
                    image.size()
                )));
            }
            let actual = checksum(&bytes);
            if actual != image.checksum() {
                return Err(HcgError::PayloadChecksum {
                    key: image.key().to_string(),
                    expected: image.checksum(),
                    actual,
                });
            }
            self.out.write_all(&bytes)?;
            if image.is_delta() {
                deltas += 1;
            }
        }
        self.out.write_all(&BOUNDARY_MARKER)?;

        // ── Tail index + footer ────────────────────────────────────────────
        let tail = encode_entries(src, &slots, &position, tail_start, data_start)?;
        self.out.write_all(&IndexBlock::encode(&tail))?;
        self.out.write_all(&tail_start.to_le_bytes())?;
        self.out.flush()?;

        Ok(WriteSummary {
            images: slots.len(),
            deltas,
            data_bytes: data_len,
            total_bytes: tail_start + IndexBlock::encoded_len(entries_len) + FOOTER_SIZE,
            head_index_offset: head_start,
            tail_index_offset: tail_start,
        })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Entry bytes of one index block starting at `block_start`. Only the
/// `ref_pointer`s differ between the head and the tail copy.
fn encode_entries<S>(
    src: &S,
    slots: &[Slot],
    position: &HashMap<ImageId, usize>,
    block_start: u64,
    data_start: u64,
) -> Result<Vec<u8>>
where
    S: ImageSource + ?Sized,
{
    let records_start = block_start + INDEX_LENGTH_SIZE;
    let mut buf = Vec::new();
    for slot in slots {
        let image = src.image(slot.id)?;
        let ref_pointer = match image.reference() {
            Some(reference) => records_start + slots[position[&reference]].record,
            None => NULL_REF,
        };
        IndexEntry {
            key: image.key().to_string(),
            data_offset: data_start + slot.heap,
            ref_pointer,
            payload_size: image.size(),
            checksum: image.checksum(),
        }
        .write_to(&mut buf)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    use crate::codec::PixelCodec;
    use crate::error::CodecError;
    use crate::format::{IndexCopy, PREAMBLE_SIZE};
    use crate::pack::Pack;
    use crate::pixels::{ColorMode, Pixels};
    use crate::reader::{ArchiveReader, IndexChoice, ReadOptions};

    /// `[width, height, gray bytes...]`, small enough to reason about offsets.
    struct RawGray;

    impl PixelCodec for RawGray {
        fn name(&self) -> &'static str {
            "raw-gray"
        }

        fn decode(&self, bytes: &[u8]) -> Result<Pixels, CodecError> {
            if bytes.len() < 2 {
                return Err(CodecError::Decode("short".into()));
            }
            Pixels::new(ColorMode::Gray, bytes[0].into(), bytes[1].into(), bytes[2..].to_vec())
                .map_err(|e| CodecError::Decode(e.to_string()))
        }

        fn encode_png(&self, pixels: &Pixels) -> Result<Vec<u8>, CodecError> {
            let mut out = vec![pixels.width as u8, pixels.height as u8];
            out.extend_from_slice(&pixels.data);
            Ok(out)
        }
    }

    fn write_to_vec(pack: &Pack, comment: &[u8]) -> (Vec<u8>, WriteSummary) {
        let mut buf = Vec::new();
        let summary = ArchiveWriter::new(&mut buf)
            .with_comment(comment.to_vec())
            .write(pack)
            .unwrap();
        (buf, summary)
    }

    #[test]
    fn empty_archive_layout() {
        let pack = Pack::new(Arc::new(RawGray));
        let (buf, summary) = write_to_vec(&pack, b"");

        let head = PREAMBLE_SIZE;
        let tail = head + 12 + 8;
        assert_eq!(summary.total_bytes, buf.len() as u64);
        assert_eq!(summary.tail_index_offset, tail);
        assert_eq!(buf.len() as u64, tail + 12 + 8);
        assert_eq!(&buf[head as usize..head as usize + 8], &0u64.to_le_bytes());
        assert_eq!(&buf[buf.len() - 8..], &tail.to_le_bytes());

        let reader =
            ArchiveReader::from_stream(Cursor::new(buf), Arc::new(RawGray), ReadOptions::default())
                .unwrap();
        assert!(reader.is_empty());
        assert_eq!(reader.comment(), b"");
    }

    #[test]
    fn ref_pointers_are_rebased_per_copy() {
        let mut pack = Pack::new(Arc::new(RawGray));
        let base = pack.add_bytes("b", vec![2, 2, 10, 20, 30, 40]).unwrap();
        let target = pack.add_bytes("a", vec![2, 2, 11, 21, 31, 41]).unwrap();
        assert!(pack.make_ref(target, base, 2.0).unwrap());

        let (buf, summary) = write_to_vec(&pack, b"hi");
        assert_eq!(summary.images, 2);
        assert_eq!(summary.deltas, 1);

        let reader = ArchiveReader::from_stream(
            Cursor::new(buf.clone()),
            Arc::new(RawGray),
            ReadOptions { index: IndexChoice::Tail },
        )
        .unwrap();
        let head = reader.index_entries(IndexCopy::Head).unwrap();
        let tail = reader.index_entries(IndexCopy::Tail).unwrap();

        // "a" sorts before "b"; it is the delta and points at b's record.
        assert_eq!(head[0].1.key, "a");
        assert_eq!(head[0].1.ref_pointer, head[1].0);
        assert_eq!(tail[0].1.ref_pointer, tail[1].0);
        assert_ne!(head[0].1.ref_pointer, tail[0].1.ref_pointer);
        assert_eq!(tail[1].0 - head[1].0, summary.tail_index_offset - summary.head_index_offset);

        let a = reader.get("a").unwrap();
        assert_eq!(reader.image(a.reference().unwrap()).unwrap().key(), "b");
        assert_eq!(a.decoded_pixels(&reader).unwrap().data, vec![11, 21, 31, 41]);
    }
}
