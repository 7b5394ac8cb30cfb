use std::path::Path;

use crate::error::CodecError;
use crate::pixels::Pixels;

/// The external image codec the archive delegates pixel work to.
///
/// The archive itself never interprets encoded image bytes. It only needs to
/// turn them into raw [`Pixels`] (for sampling and diffing) and to turn raw
/// pixels back into a PNG (delta payloads) or a file on disk (extracting a
/// delta-encoded image, whose original bytes no longer exist).
pub trait PixelCodec: Send + Sync {
    /// Human-readable codec name for CLI display.
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<Pixels, CodecError>;

    /// Losslessly encode `pixels` as PNG.
    fn encode_png(&self, pixels: &Pixels) -> Result<Vec<u8>, CodecError>;

    /// Save `pixels` to `path`. Implementations may pick the output format
    /// from the extension; the default always writes PNG.
    fn save(&self, pixels: &Pixels, path: &Path) -> Result<(), CodecError> {
        let encoded = self.encode_png(pixels)?;
        std::fs::write(path, encoded)
            .map_err(|e| CodecError::Encode(format!("writing {}: {}", path.display(), e)))
    }
}
