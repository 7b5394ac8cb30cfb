pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod format;
pub mod image;
pub mod pack;
pub mod pixels;
pub mod pool;
pub mod reader;
pub mod sampling;
pub mod writer;

pub use codec::PixelCodec;
pub use config::{PackConfig, DEFAULT_THRESHOLD};
pub use error::{CodecError, HcgError, Result};
pub use format::{IndexCopy, IndexEntry, MAGIC};
pub use image::{Image, ImageId, ImageSource, ImageState};
pub use pack::{DeltaPlan, Pack};
pub use pixels::{ColorMode, Group, Pixels};
pub use pool::{Sizing, TaskFailure, WorkerPool};
pub use reader::{ArchiveReader, IndexChoice, ReadOptions};
pub use sampling::Sample;
pub use writer::{ArchiveWriter, WriteSummary};
