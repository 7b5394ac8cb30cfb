use crate::format::IndexCopy;
use crate::pixels::ColorMode;

pub type Result<T, E = HcgError> = std::result::Result<T, E>;

/// Failure reported by a [`PixelCodec`](crate::codec::PixelCodec) implementation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Every error the archive library can produce.
#[derive(Debug, thiserror::Error)]
pub enum HcgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, truncated header or a malformed index entry.
    #[error("malformed archive: {0}")]
    Format(String),

    #[error(
        "{copy} index checksum mismatch for block at offset {offset}: \
         expected {expected:08x}, computed {actual:08x}"
    )]
    IndexChecksum {
        copy: IndexCopy,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("tail index boundary marker at offset {offset} is not zeroed: {found:02x?}")]
    BoundaryMarker { offset: u64, found: [u8; 8] },

    #[error("payload checksum mismatch for {key:?}: expected {expected:08x}, got {actual:08x}")]
    PayloadChecksum {
        key: String,
        expected: u32,
        actual: u32,
    },

    /// Neither index copy could be trusted.
    #[error("archive is unreadable; head index: {head}; tail index: {tail}")]
    Unreadable {
        head: Box<HcgError>,
        tail: Box<HcgError>,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("color mode {0} has no channel layout defined for sampling")]
    UnsupportedMode(ColorMode),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("duplicate image key {0:?}")]
    DuplicateKey(String),

    /// The key would resolve outside the extraction directory.
    #[error("refusing to extract {0:?}: key is not a plain relative path")]
    UnsafeKey(String),

    #[error("invalid delta reference: {0}")]
    InvalidReference(String),

    #[error("worker pool: {0}")]
    Pool(String),
}

impl HcgError {
    /// True for checksum and boundary-marker failures, i.e. the bytes are
    /// structurally readable but cannot be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            HcgError::IndexChecksum { .. }
                | HcgError::BoundaryMarker { .. }
                | HcgError::PayloadChecksum { .. }
        )
    }
}
