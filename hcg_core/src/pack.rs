use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::PixelCodec;
use crate::delta;
use crate::error::{HcgError, Result};
use crate::image::{key_order, Image, ImageId, ImageSource};
use crate::pixels::{Group, Pixels};
use crate::pool::WorkerPool;
use crate::sampling::{self, Sample};

/// Outcome of [`Pack::plan_deltas`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPlan {
    /// Groups holding at least two images.
    pub groups: usize,
    /// `make_ref` calls attempted.
    pub attempts: usize,
    /// Images now stored as deltas.
    pub committed: usize,
    /// Images left out of planning because they could not be decoded or
    /// sampled.
    pub skipped: usize,
}

/// The writer-side image collection: source images keyed by archive key,
/// optionally paired into deltas before being handed to an
/// [`ArchiveWriter`](crate::ArchiveWriter).
pub struct Pack {
    images: Vec<Image>,
    by_key: HashMap<String, ImageId>,
    codec: Arc<dyn PixelCodec>,
}

impl Pack {
    pub fn new(codec: Arc<dyn PixelCodec>) -> Self {
        Self {
            images: Vec::new(),
            by_key: HashMap::new(),
            codec,
        }
    }

    /// Add an image from its encoded bytes. Keys must be unique.
    pub fn add_bytes(&mut self, key: impl Into<String>, bytes: Vec<u8>) -> Result<ImageId> {
        let key = key.into();
        if self.by_key.contains_key(&key) {
            return Err(HcgError::DuplicateKey(key));
        }
        if key.len() > u16::MAX as usize {
            return Err(HcgError::Format(format!(
                "key of {} bytes exceeds the 65535-byte limit",
                key.len()
            )));
        }
        let id = ImageId(self.images.len());
        self.images.push(Image::loaded(key.clone(), bytes)?);
        self.by_key.insert(key, id);
        Ok(id)
    }

    pub fn add_file(&mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Result<ImageId> {
        let bytes = std::fs::read(path.as_ref())?;
        self.add_bytes(key, bytes)
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

    /// Image ids in archive order.
    pub fn write_order(&self) -> Vec<ImageId> {
        let mut order: Vec<ImageId> = (0..self.images.len()).map(ImageId).collect();
        order.sort_by(|a, b| key_order(self.images[a.0].key(), self.images[b.0].key()));
        order
    }

    pub fn delta_count(&self) -> usize {
        self.images.iter().filter(|i| i.is_delta()).count()
    }

    /// Dissimilarity of two images of the same group.
    pub fn dissimilarity(&self, a: ImageId, b: ImageId, pool: &WorkerPool) -> Result<f64> {
        let (left, right) = (self.image(a)?, self.image(b)?);
        let (left_group, right_group) = (left.group(self)?, right.group(self)?);
        if left_group != right_group {
            return Err(HcgError::ShapeMismatch(format!(
                "{:?} is {} but {:?} is {}",
                left.key(),
                left_group,
                right.key(),
                right_group
            )));
        }
        let (left_sample, right_sample) = (left.sample(self, pool)?, right.sample(self, pool)?);
        sampling::dissimilarity(&left_sample, &right_sample)
    }

    /// Try to store `target` as a delta against `reference`.
    ///
    /// The delta is committed only when its PNG encoding is smaller than
    /// `threshold` times the currently stored size; otherwise the image is
    /// left untouched and `Ok(false)` is returned. A committed delta is
    /// final.
    pub fn make_ref(
        &mut self,
        target: ImageId,
        reference: ImageId,
        threshold: f64,
    ) -> Result<bool> {
        if target == reference {
            return Err(HcgError::InvalidReference("an image cannot reference itself".into()));
        }
        let (image, base) = (self.image(target)?, self.image(reference)?);
        if image.is_delta() {
            return Err(HcgError::InvalidReference(format!(
                "{:?} is already delta-encoded",
                image.key()
            )));
        }
        if base.is_delta() {
            return Err(HcgError::InvalidReference(format!(
                "{:?} is delta-encoded and cannot serve as a reference",
                base.key()
            )));
        }
        if self.images.iter().any(|i| i.reference() == Some(target)) {
            return Err(HcgError::InvalidReference(format!(
                "{:?} is the reference of another image",
                image.key()
            )));
        }

        let pixels = image.decoded_pixels(self)?;
        let base_pixels = base.decoded_pixels(self)?;
        if pixels.group() != base_pixels.group() {
            return Err(HcgError::ShapeMismatch(format!(
                "{:?} is {} but reference {:?} is {}",
                image.key(),
                pixels.group(),
                base.key(),
                base_pixels.group()
            )));
        }

        let diff = delta::diff(&pixels.data, &base_pixels.data)?;
        let encoded = self
            .codec
            .encode_png(&Pixels::new(pixels.mode, pixels.width, pixels.height, diff)?)?;

        let original = image.size();
        if (encoded.len() as f64) < threshold * f64::from(original) {
            debug!(
                key = image.key(),
                reference = base.key(),
                original = original,
                delta = encoded.len(),
                "committing delta"
            );
            self.images[target.0].promote(reference, encoded)?;
            Ok(true)
        } else {
            debug!(
                key = image.key(),
                reference = base.key(),
                original = original,
                delta = encoded.len(),
                "delta not worth it"
            );
            Ok(false)
        }
    }

    /// Greedy delta pairing.
    ///
    /// Images are grouped by [`Group`] in archive order. Within a group each
    /// image is scored against the self-contained anchors seen so far and
    /// [`make_ref`](Pack::make_ref) is tried against the closest one; an image
    /// that stays self-contained becomes an anchor. Images that cannot be
    /// decoded or sampled stay self-contained.
    pub fn plan_deltas(&mut self, pool: &WorkerPool, threshold: f64) -> Result<DeltaPlan> {
        let mut plan = DeltaPlan::default();
        let mut groups: Vec<(Group, Vec<ImageId>)> = Vec::new();
        let mut slots: HashMap<Group, usize> = HashMap::new();

        for id in self.write_order() {
            let image = &self.images[id.0];
            if image.is_delta() {
                continue;
            }
            match image.group(self) {
                Ok(group) => {
                    let slot = *slots.entry(group).or_insert_with(|| {
                        groups.push((group, Vec::new()));
                        groups.len() - 1
                    });
                    groups[slot].1.push(id);
                }
                Err(e) => {
                    warn!(key = image.key(), error = %e, "cannot decode image, storing it as is");
                    plan.skipped += 1;
                }
            }
        }

        for (group, members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
            plan.groups += 1;
            debug!(group = %group, images = members.len(), "planning deltas");
            let mut anchors: Vec<(ImageId, Arc<Sample>)> = Vec::new();

            for id in members {
                let sample = match self.images[id.0].sample(self, pool) {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!(
                            key = self.images[id.0].key(),
                            error = %e,
                            "cannot sample image, storing it as is"
                        );
                        plan.skipped += 1;
                        continue;
                    }
                };

                let mut best: Option<(ImageId, f64)> = None;
                for (anchor, anchor_sample) in &anchors {
                    let score = sampling::dissimilarity(&sample, anchor_sample)?;
                    if best.map_or(true, |(_, s)| score < s) {
                        best = Some((*anchor, score));
                    }
                }

                let committed = match best {
                    None => false,
                    Some((anchor, score)) => {
                        plan.attempts += 1;
                        debug!(
                            key = self.images[id.0].key(),
                            anchor = self.images[anchor.0].key(),
                            score = score,
                            "closest anchor"
                        );
                        match self.make_ref(id, anchor, threshold) {
                            Ok(committed) => committed,
                            Err(e) => {
                                warn!(
                                    key = self.images[id.0].key(),
                                    error = %e,
                                    "delta attempt failed"
                                );
                                false
                            }
                        }
                    }
                };

                if committed {
                    plan.committed += 1;
                } else {
                    anchors.push((id, sample));
                }
            }
        }

        Ok(plan)
    }
}

impl ImageSource for Pack {
    fn images(&self) -> &[Image] {
        &self.images
    }

    fn codec(&self) -> &dyn PixelCodec {
        self.codec.as_ref()
    }

    fn read_stored(&self, offset: u64, _size: u32) -> Result<Vec<u8>> {
        Err(HcgError::Format(format!(
            "pack images are held in memory; nothing is stored at offset {}",
            offset
        )))
    }

    fn lookup(&self, key: &str) -> Option<ImageId> {
        self.by_key.get(key).copied()
    }
}
