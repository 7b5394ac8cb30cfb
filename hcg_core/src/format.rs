use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{HcgError, Result};

/// Magic bytes opening every HCG001 archive.
pub const MAGIC: &[u8; 8] = b"HCG001\r\n";

/// Size of the comment length field: six ASCII hex digits + "\r\n".
pub const COMMENT_LENGTH_SIZE: u64 = 8;

/// Bytes before the comment body: magic[8] + comment length[8].
pub const PREAMBLE_SIZE: u64 = 16;

/// Largest comment the six-digit hex length field can describe.
pub const MAX_COMMENT_LEN: usize = 0xFF_FFFF;

/// Size of the declared entries-length prefix of an index block.
pub const INDEX_LENGTH_SIZE: u64 = 8;

/// Size of the CRC-32 trailer of an index block.
pub const INDEX_CHECKSUM_SIZE: u64 = 4;

/// Fixed part of one index entry, in bytes.
///   key_length:u16 + data_offset:u64 + ref_pointer:u64
///   + payload_size:u32 + checksum:u32
///   = 2 + 8 + 8 + 4 + 4 = 26
pub const ENTRY_FIXED_SIZE: usize = 26;

/// Zero bytes separating the data heap from the tail index block.
pub const BOUNDARY_MARKER: [u8; 8] = [0u8; 8];

/// Size of the footer: the absolute offset of the tail index block.
pub const FOOTER_SIZE: u64 = 8;

/// `ref_pointer` value meaning "no reference".
pub const NULL_REF: u64 = 0;

pub const DEFAULT_COMMENT: &str = "This file was created by hcg, a delta-aware image archiver.\r\n\
Every image is either stored verbatim or as a PNG-encoded byte delta \
against another image in the same archive.";

/// Which of the two redundant index copies is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexCopy {
    Head,
    Tail,
}

impl fmt::Display for IndexCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexCopy::Head => f.write_str("head"),
            IndexCopy::Tail => f.write_str("tail"),
        }
    }
}

// ── Preamble ───────────────────────────────────────────────────────────────

/// Serialize magic, comment length and comment body.
pub fn encode_preamble(comment: &[u8]) -> Result<Vec<u8>> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(HcgError::Format(format!(
            "comment is {} bytes, the header allows at most {}",
            comment.len(),
            MAX_COMMENT_LEN
        )));
    }
    let mut buf = Vec::with_capacity(PREAMBLE_SIZE as usize + comment.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(format!("{:06x}\r\n", comment.len()).as_bytes());
    buf.extend_from_slice(comment);
    Ok(buf)
}

/// Decode the eight-byte comment length field.
pub fn parse_comment_length(field: &[u8; COMMENT_LENGTH_SIZE as usize]) -> Result<usize> {
    let text = std::str::from_utf8(field)
        .map_err(|_| HcgError::Format("comment length field is not ASCII".into()))?;
    usize::from_str_radix(text.trim_matches(|c: char| c.is_ascii_whitespace()), 16)
        .map_err(|_| HcgError::Format(format!("comment length field {:?} is not hex", text)))
}

// ── Index entry ────────────────────────────────────────────────────────────

/// One directory record of an index block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    /// Absolute offset of the stored payload.
    pub data_offset: u64,
    /// Absolute offset of the referenced entry's record inside the same
    /// index block, or [`NULL_REF`].
    pub ref_pointer: u64,
    /// Stored payload length (the delta payload for delta-encoded images).
    pub payload_size: u32,
    /// CRC-32 of the stored payload.
    pub checksum: u32,
}

impl IndexEntry {
    /// Bytes this entry occupies on disk.
    pub fn encoded_len(&self) -> usize {
        ENTRY_FIXED_SIZE + self.key.len()
    }

    /// Append the serialized entry to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let key_len = u16::try_from(self.key.len()).map_err(|_| {
            HcgError::Format(format!(
                "key of {} bytes exceeds the 65535-byte limit",
                self.key.len()
            ))
        })?;
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.data_offset.to_le_bytes());
        buf.extend_from_slice(&self.ref_pointer.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        Ok(())
    }

    /// Parse every entry in `entries`, the raw entry bytes of a block whose
    /// length prefix starts at `block_start`.
    ///
    /// Returns each entry with the absolute offset of its own record, which
    /// is what `ref_pointer` values in the same block point at. The running
    /// counter starts at zero and counts entry bytes only.
    pub fn parse_all(entries: &[u8], block_start: u64) -> Result<Vec<(u64, IndexEntry)>> {
        let records_start = block_start + INDEX_LENGTH_SIZE;
        let mut parsed = Vec::new();
        let mut consumed = 0usize;

        while consumed < entries.len() {
            let record = &entries[consumed..];
            let record_offset = records_start + consumed as u64;
            if record.len() < ENTRY_FIXED_SIZE {
                return Err(HcgError::Format(format!(
                    "truncated index entry at offset {}: {} of {} fixed bytes",
                    record_offset,
                    record.len(),
                    ENTRY_FIXED_SIZE
                )));
            }

            let key_len = u16::from_le_bytes([record[0], record[1]]) as usize;
            let end = ENTRY_FIXED_SIZE + key_len;
            if record.len() < end {
                return Err(HcgError::Format(format!(
                    "index entry at offset {} declares a {}-byte key past the end of the block",
                    record_offset, key_len
                )));
            }
            let key = String::from_utf8(record[ENTRY_FIXED_SIZE..end].to_vec()).map_err(|_| {
                HcgError::Format(format!(
                    "index entry at offset {} has a non UTF-8 key",
                    record_offset
                ))
            })?;

            parsed.push((
                record_offset,
                IndexEntry {
                    key,
                    data_offset: le_u64(&record[2..10]),
                    ref_pointer: le_u64(&record[10..18]),
                    payload_size: le_u32(&record[18..22]),
                    checksum: le_u32(&record[22..26]),
                },
            ));
            consumed += end;
        }

        Ok(parsed)
    }
}

// ── Index block ────────────────────────────────────────────────────────────

/// CRC-32 (IEEE) used for both index blocks and payloads.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// A raw index block: `[len:u64][entries][crc32:u32]`.
#[derive(Debug, Clone)]
pub struct IndexBlock {
    /// Absolute offset of the length prefix.
    pub start: u64,
    pub entries: Vec<u8>,
    pub stored_checksum: u32,
}

impl IndexBlock {
    /// Serialize a block around already-encoded entry bytes.
    pub fn encode(entries: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(entries.len() + 12);
        buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        buf.extend_from_slice(entries);
        buf.extend_from_slice(&checksum(entries).to_le_bytes());
        buf
    }

    /// Total on-disk size of a block holding `entries_len` entry bytes.
    pub fn encoded_len(entries_len: u64) -> u64 {
        INDEX_LENGTH_SIZE + entries_len + INDEX_CHECKSUM_SIZE
    }

    /// Read the block starting at `start`. `stream_len` bounds the declared
    /// length so a corrupt prefix cannot trigger a huge allocation.
    pub fn read_from<R: Read + Seek>(
        stream: &mut R,
        start: u64,
        stream_len: u64,
        copy: IndexCopy,
    ) -> Result<Self> {
        stream.seek(SeekFrom::Start(start))?;
        let mut len_buf = [0u8; 8];
        read_or_truncated(stream, &mut len_buf, copy, start)?;
        let declared = u64::from_le_bytes(len_buf);

        let fits = start
            .checked_add(INDEX_LENGTH_SIZE)
            .and_then(|end| end.checked_add(declared))
            .and_then(|end| end.checked_add(INDEX_CHECKSUM_SIZE))
            .is_some_and(|end| end <= stream_len);
        if !fits {
            return Err(HcgError::Format(format!(
                "{} index at offset {} declares {} entry bytes, past the archive end ({} bytes)",
                copy, start, declared, stream_len
            )));
        }

        let mut entries = vec![0u8; declared as usize];
        read_or_truncated(stream, &mut entries, copy, start)?;
        let mut crc_buf = [0u8; 4];
        read_or_truncated(stream, &mut crc_buf, copy, start)?;

        Ok(Self {
            start,
            entries,
            stored_checksum: u32::from_le_bytes(crc_buf),
        })
    }

    /// Recompute the checksum over the entry bytes and compare.
    pub fn verify(&self, copy: IndexCopy) -> Result<()> {
        let actual = checksum(&self.entries);
        if actual != self.stored_checksum {
            return Err(HcgError::IndexChecksum {
                copy,
                offset: self.start,
                expected: self.stored_checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn parse(&self) -> Result<Vec<(u64, IndexEntry)>> {
        IndexEntry::parse_all(&self.entries, self.start)
    }

    /// Offset one past the checksum trailer.
    pub fn end(&self) -> u64 {
        self.start + Self::encoded_len(self.entries.len() as u64)
    }
}

fn read_or_truncated<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    copy: IndexCopy,
    start: u64,
) -> Result<()> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            HcgError::Format(format!("{} index at offset {} is truncated", copy, start))
        }
        _ => HcgError::Io(e),
    })
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}
