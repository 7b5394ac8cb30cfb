use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Component, Path};
use std::sync::{Arc, OnceLock};

use crate::codec::PixelCodec;
use crate::delta;
use crate::error::{HcgError, Result};
use crate::format::checksum;
use crate::pixels::{Group, Pixels};
use crate::pool::WorkerPool;
use crate::sampling::{self, Sample, SampleCell};

/// Position of an image inside its collection (a [`Pack`](crate::Pack) or
/// an [`ArchiveReader`](crate::ArchiveReader)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub(crate) usize);

impl ImageId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an image's stored bytes live.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    /// Held in memory (writer side).
    Loaded(Vec<u8>),
    /// In the archive's data heap at an absolute offset (reader side).
    Stored { offset: u64 },
}

#[derive(Debug, Clone)]
pub(crate) enum Content {
    /// The original encoded file, kept verbatim.
    SelfContained(Payload),
    /// A PNG of `pixels - reference pixels (mod 256)`.
    DeltaEncoded { delta: Payload, reference: ImageId },
}

/// Public view of an image's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    SelfContained,
    DeltaEncoded { reference: ImageId },
}

/// A collection images resolve their payloads and references through.
pub trait ImageSource {
    fn images(&self) -> &[Image];

    fn codec(&self) -> &dyn PixelCodec;

    /// Read `size` stored bytes at absolute `offset` of the backing archive.
    fn read_stored(&self, offset: u64, size: u32) -> Result<Vec<u8>>;

    fn lookup(&self, key: &str) -> Option<ImageId>;

    fn image(&self, id: ImageId) -> Result<&Image> {
        self.images().get(id.0).ok_or_else(|| {
            HcgError::InvalidReference(format!("no image {} in this collection", id))
        })
    }
}

/// One logical picture: self-contained or delta-encoded against another
/// image of the same collection.
pub struct Image {
    key: String,
    size: u32,
    checksum: u32,
    content: Content,
    group: OnceLock<Group>,
    sample: SampleCell,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("checksum", &format_args!("{:08x}", self.checksum))
            .field("state", &self.state())
            .finish()
    }
}

impl Image {
    /// A writer-side image holding its original bytes.
    pub(crate) fn loaded(key: String, bytes: Vec<u8>) -> Result<Self> {
        let size = payload_size(&key, bytes.len())?;
        Ok(Self {
            checksum: checksum(&bytes),
            size,
            content: Content::SelfContained(Payload::Loaded(bytes)),
            key,
            group: OnceLock::new(),
            sample: SampleCell::new(),
        })
    }

    /// A reader-side image backed by the archive stream.
    pub(crate) fn stored(
        key: String,
        offset: u64,
        size: u32,
        checksum: u32,
        reference: Option<ImageId>,
    ) -> Self {
        let payload = Payload::Stored { offset };
        let content = match reference {
            Some(reference) => Content::DeltaEncoded {
                delta: payload,
                reference,
            },
            None => Content::SelfContained(payload),
        };
        Self {
            key,
            size,
            checksum,
            content,
            group: OnceLock::new(),
            sample: SampleCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored payload size (the delta payload once delta-encoded).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// CRC-32 of the stored payload.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn state(&self) -> ImageState {
        match &self.content {
            Content::SelfContained(_) => ImageState::SelfContained,
            Content::DeltaEncoded { reference, .. } => ImageState::DeltaEncoded {
                reference: *reference,
            },
        }
    }

    pub fn reference(&self) -> Option<ImageId> {
        match &self.content {
            Content::SelfContained(_) => None,
            Content::DeltaEncoded { reference, .. } => Some(*reference),
        }
    }

    pub fn is_delta(&self) -> bool {
        self.reference().is_some()
    }

    /// Archive ordering: shorter keys first, then lexicographic.
    pub fn cmp_key(&self, other: &Image) -> Ordering {
        key_order(&self.key, &other.key)
    }

    /// The bytes that go into (or came from) the data heap.
    pub fn stored_bytes<'a, S>(&'a self, src: &S) -> Result<Cow<'a, [u8]>>
    where
        S: ImageSource + ?Sized,
    {
        let payload = match &self.content {
            Content::SelfContained(payload) => payload,
            Content::DeltaEncoded { delta, .. } => delta,
        };
        match payload {
            Payload::Loaded(bytes) => Ok(Cow::Borrowed(bytes)),
            Payload::Stored { offset } => Ok(Cow::Owned(src.read_stored(*offset, self.size)?)),
        }
    }

    /// Recompute the payload checksum and compare it with the recorded one.
    pub fn verify<S>(&self, src: &S) -> Result<()>
    where
        S: ImageSource + ?Sized,
    {
        let actual = checksum(&self.stored_bytes(src)?);
        if actual != self.checksum {
            return Err(HcgError::PayloadChecksum {
                key: self.key.clone(),
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Raw pixels of the original picture, merging a delta payload back
    /// onto its reference when needed.
    pub fn decoded_pixels<S>(&self, src: &S) -> Result<Pixels>
    where
        S: ImageSource + ?Sized,
    {
        let stored = self.stored_bytes(src)?;
        let decoded = src.codec().decode(&stored)?;
        let Some(reference) = self.reference() else {
            return Ok(decoded);
        };

        let base_image = src.image(reference)?;
        if base_image.is_delta() {
            return Err(HcgError::InvalidReference(format!(
                "{:?} references {:?}, which is itself delta-encoded",
                self.key, base_image.key
            )));
        }
        let base = base_image.decoded_pixels(src)?;
        let mut data = decoded.data;
        delta::merge_in_place(&mut data, &base.data)?;
        Pixels::new(base.mode, base.width, base.height, data)
    }

    /// `(width, height, mode)` of the decoded picture, cached.
    pub fn group<S>(&self, src: &S) -> Result<Group>
    where
        S: ImageSource + ?Sized,
    {
        if let Some(group) = self.group.get() {
            return Ok(*group);
        }
        let group = self.decoded_pixels(src)?.group();
        Ok(*self.group.get_or_init(|| group))
    }

    /// The block-sum fingerprint, computed once and shared afterwards.
    pub fn sample<S>(&self, src: &S, pool: &WorkerPool) -> Result<Arc<Sample>>
    where
        S: ImageSource + ?Sized,
    {
        self.sample.get_or_compute(|| {
            let pixels = self.decoded_pixels(src)?;
            let _ = self.group.set(pixels.group());
            sampling::compute_sample(Arc::new(pixels), pool)
        })
    }

    /// Cached sample, if one was already computed.
    pub fn cached_sample(&self) -> Option<Arc<Sample>> {
        self.sample.get()
    }

    /// Write the picture to `path`.
    ///
    /// A self-contained image is copied byte for byte, so lossy sources are
    /// never re-encoded. A delta-encoded image is rebuilt and saved through
    /// the codec.
    pub fn extract<S>(&self, src: &S, path: &Path) -> Result<()>
    where
        S: ImageSource + ?Sized,
    {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        match &self.content {
            Content::SelfContained(_) => fs::write(path, self.stored_bytes(src)?)?,
            Content::DeltaEncoded { .. } => {
                let pixels = self.decoded_pixels(src)?;
                src.codec().save(&pixels, path)?;
            }
        }
        Ok(())
    }

    /// [`extract`](Image::extract) to `base_dir` joined with the key.
    ///
    /// Keys come from the archive, so any key that is absolute or climbs
    /// out with `..` is refused.
    pub fn extract_to<S>(&self, src: &S, base_dir: &Path) -> Result<()>
    where
        S: ImageSource + ?Sized,
    {
        self.extract(src, &base_dir.join(relative_key_path(&self.key)?))
    }

    /// Swap the payload for a delta against `reference`. Only valid once.
    pub(crate) fn promote(&mut self, reference: ImageId, delta: Vec<u8>) -> Result<()> {
        if self.is_delta() {
            return Err(HcgError::InvalidReference(format!(
                "{:?} is already delta-encoded",
                self.key
            )));
        }
        self.size = payload_size(&self.key, delta.len())?;
        self.checksum = checksum(&delta);
        self.content = Content::DeltaEncoded {
            delta: Payload::Loaded(delta),
            reference,
        };
        Ok(())
    }
}

/// Archive ordering of keys: by character count, then by code point.
pub fn key_order(a: &str, b: &str) -> Ordering {
    a.chars()
        .count()
        .cmp(&b.chars().count())
        .then_with(|| a.cmp(b))
}

/// `key` as a path that stays below whatever directory it is joined to.
pub fn relative_key_path(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if key.is_empty() || escapes {
        return Err(HcgError::UnsafeKey(key.to_string()));
    }
    Ok(path)
}

fn payload_size(key: &str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        HcgError::Format(format!(
            "payload of {:?} is {} bytes, entries hold at most {}",
            key,
            len,
            u32::MAX
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    struct NoCodec;

    impl PixelCodec for NoCodec {
        fn name(&self) -> &'static str {
            "none"
        }

        fn decode(&self, _bytes: &[u8]) -> Result<Pixels, CodecError> {
            Err(CodecError::Decode("no codec".into()))
        }

        fn encode_png(&self, _pixels: &Pixels) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Encode("no codec".into()))
        }
    }

    struct NoSource(Vec<Image>);

    impl ImageSource for NoSource {
        fn images(&self) -> &[Image] {
            &self.0
        }

        fn codec(&self) -> &dyn PixelCodec {
            &NoCodec
        }

        fn read_stored(&self, offset: u64, _size: u32) -> Result<Vec<u8>> {
            Err(HcgError::Format(format!("nothing stored at {}", offset)))
        }

        fn lookup(&self, _key: &str) -> Option<ImageId> {
            None
        }
    }

    #[test]
    fn keys_order_by_length_then_text() {
        let mut keys = vec!["b10", "a", "b2", "b1", "aa", "z"];
        keys.sort_by(|a, b| key_order(a, b));
        assert_eq!(keys, vec!["a", "z", "aa", "b1", "b2", "b10"]);
    }

    #[test]
    fn escaping_keys_are_refused() {
        assert!(relative_key_path("dir/img.png").is_ok());
        assert!(relative_key_path("./img.png").is_ok());
        for key in ["../evil.png", "a/../../evil.png", "/etc/passwd", ""] {
            assert!(
                matches!(relative_key_path(key), Err(HcgError::UnsafeKey(_))),
                "{:?} should be refused",
                key
            );
        }

        let dir = std::env::temp_dir().join("hcg-escaping-keys");
        let image = Image::loaded("../outside.png".into(), vec![1, 2, 3]).unwrap();
        let src = NoSource(vec![]);
        assert!(matches!(image.extract_to(&src, &dir), Err(HcgError::UnsafeKey(_))));
    }

    #[test]
    fn key_length_counts_characters() {
        // Both are two bytes long, but "é" is a single character.
        assert_eq!(key_order("é", "ab"), Ordering::Less);
        let mut keys = vec!["ab", "éé", "é", "z"];
        keys.sort_by(|a, b| key_order(a, b));
        assert_eq!(keys, vec!["z", "é", "ab", "éé"]);
    }

    #[test]
    fn promote_is_one_shot() {
        let mut image = Image::loaded("frame".into(), vec![1, 2, 3, 4]).unwrap();
        assert_eq!(image.state(), ImageState::SelfContained);
        assert_eq!(image.checksum(), checksum(&[1, 2, 3, 4]));

        image.promote(ImageId(3), vec![9, 9]).unwrap();
        assert_eq!(image.state(), ImageState::DeltaEncoded { reference: ImageId(3) });
        assert_eq!(image.size(), 2);
        assert_eq!(image.checksum(), checksum(&[9, 9]));

        assert!(image.promote(ImageId(4), vec![1]).is_err());
        assert_eq!(image.reference(), Some(ImageId(3)));
    }
}
