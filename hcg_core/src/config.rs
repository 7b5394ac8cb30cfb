use crate::format::DEFAULT_COMMENT;
use crate::pool::{Sizing, WorkerPool};

/// Default ratio a delta payload must beat: half the original size.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Settings for building an archive.
#[derive(Debug, Clone)]
pub struct PackConfig {
    /// A delta is kept only if `delta_len < threshold * original_len`.
    pub threshold: f64,
    pub comment: Vec<u8>,
    /// Sampling workers; `None` uses the available parallelism.
    pub threads: Option<usize>,
    pub sizing: Sizing,
    /// Run delta planning at all.
    pub deltas: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            comment: DEFAULT_COMMENT.as_bytes().to_vec(),
            threads: None,
            sizing: Sizing::Fixed,
            deltas: true,
        }
    }
}

impl PackConfig {
    pub fn build_pool(&self) -> WorkerPool {
        let mut builder = WorkerPool::builder().name("hcg-sampler").sizing(self.sizing);
        if let Some(threads) = self.threads {
            builder = builder.size(threads);
        }
        builder.build()
    }
}
