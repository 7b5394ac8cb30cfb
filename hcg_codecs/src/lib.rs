mod image_rs;

pub use image_rs::ImageRsCodec;

use hcg_core::PixelCodec;
use std::sync::Arc;

/// The codec archives are read and written with unless the caller supplies
/// another one.
pub fn default_codec() -> Arc<dyn PixelCodec> {
    Arc::new(ImageRsCodec)
}
