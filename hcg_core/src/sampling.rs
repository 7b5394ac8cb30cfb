//! Block-sum fingerprints ("samples") and the dissimilarity score used to
//! rank delta candidates.
//!
//! A sample partitions the image into a coarse grid (roughly one block per
//! 100 pixels along each axis) and sums every channel inside each block.
//! Blocks are computed in parallel on a [`WorkerPool`].

use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{HcgError, Result};
use crate::pixels::Pixels;
use crate::pool::WorkerPool;

/// Nominal segment length along each axis.
pub const SEGMENT_LENGTH: u32 = 100;

/// A half-open block `[left, right) x [top, bottom)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Number of segments for an axis of `length` pixels: `length / 100`
/// rounded half-to-even, never less than one.
pub fn segment_count(length: u32) -> u32 {
    let whole = length / SEGMENT_LENGTH;
    let rest = length % SEGMENT_LENGTH;
    let half = SEGMENT_LENGTH / 2;
    let rounded = if rest > half || (rest == half && whole % 2 == 1) {
        whole + 1
    } else {
        whole
    };
    rounded.max(1)
}

/// Split `0..length` into equal segments, the last absorbing the remainder.
pub fn split_line(length: u32) -> Vec<(u32, u32)> {
    let segments = segment_count(length);
    let fixed = length / segments;
    let mut bounds: Vec<(u32, u32)> = (0..segments - 1)
        .map(|i| (fixed * i, fixed * (i + 1)))
        .collect();
    bounds.push((fixed * (segments - 1), length));
    bounds
}

/// Grid of blocks covering a `width x height` image, row-major.
pub fn split_rect(width: u32, height: u32) -> Vec<Rect> {
    let columns = split_line(width);
    split_line(height)
        .into_iter()
        .flat_map(|(top, bottom)| {
            columns
                .iter()
                .map(move |&(left, right)| Rect::new(left, top, right, bottom))
        })
        .collect()
}

/// Per-channel sums over one block of a row-major buffer.
pub fn sample_block(data: &[u8], width: u32, channels: usize, rect: Rect) -> Result<Vec<u64>> {
    if rect.right > width || rect.left > rect.right || rect.top > rect.bottom {
        return Err(HcgError::ShapeMismatch(format!(
            "block {:?} does not fit a {}-pixel wide image",
            rect, width
        )));
    }
    let stride = width as usize * channels;
    let needed = rect.bottom as usize * stride;
    if data.len() < needed {
        return Err(HcgError::ShapeMismatch(format!(
            "block {:?} needs {} bytes, buffer has {}",
            rect,
            needed,
            data.len()
        )));
    }

    let mut sums = vec![0u64; channels];
    let row_start = rect.left as usize * channels;
    let row_end = rect.right as usize * channels;
    for y in rect.top as usize..rect.bottom as usize {
        let row = &data[y * stride + row_start..y * stride + row_end];
        for pixel in row.chunks_exact(channels) {
            for (sum, &value) in sums.iter_mut().zip(pixel) {
                *sum += u64::from(value);
            }
        }
    }
    Ok(sums)
}

/// A fingerprint: one channel-sum vector per block, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    blocks: Vec<Vec<u64>>,
}

impl Sample {
    pub fn from_blocks(blocks: Vec<Vec<u64>>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[Vec<u64>] {
        &self.blocks
    }

    fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.iter().flatten().copied()
    }
}

/// Sample `pixels`, one pool task per block.
///
/// Blocks until every block task has reported. A failing or panicking block
/// task fails the whole call.
pub fn compute_sample(pixels: Arc<Pixels>, pool: &WorkerPool) -> Result<Sample> {
    let channels = pixels.mode.sample_channels()?;
    let rects = split_rect(pixels.width, pixels.height);
    let (tx, rx) = mpsc::channel();

    for (index, rect) in rects.iter().copied().enumerate() {
        let tx = tx.clone();
        let pixels = Arc::clone(&pixels);
        pool.assign(Box::new(move || -> anyhow::Result<()> {
            let result = sample_block(&pixels.data, pixels.width, channels, rect);
            let failure = result.as_ref().err().map(ToString::to_string);
            // The receiver is gone only if the caller already bailed out.
            let _ = tx.send((index, result));
            match failure {
                Some(message) => Err(anyhow::anyhow!("sampling block {}: {}", index, message)),
                None => Ok(()),
            }
        }))?;
    }
    drop(tx);

    let mut blocks = vec![Vec::new(); rects.len()];
    for _ in 0..rects.len() {
        let (index, result) = rx.recv().map_err(|_| {
            HcgError::Pool("a sampling task ended without reporting a result".into())
        })?;
        blocks[index] = result?;
    }
    Ok(Sample::from_blocks(blocks))
}

/// Population standard deviation of the per-position differences between
/// two samples. Zero for identical samples; lower means more alike.
pub fn dissimilarity(a: &Sample, b: &Sample) -> Result<f64> {
    let same_shape = a.blocks.len() == b.blocks.len()
        && a.blocks.iter().zip(&b.blocks).all(|(x, y)| x.len() == y.len());
    if !same_shape {
        return Err(HcgError::ShapeMismatch(
            "samples come from images of different groups".into(),
        ));
    }

    let diffs: Vec<f64> = a
        .values()
        .zip(b.values())
        .map(|(x, y)| x as f64 - y as f64)
        .collect();
    if diffs.is_empty() {
        return Ok(0.0);
    }
    let n = diffs.len() as f64;
    let avg = diffs.iter().sum::<f64>() / n;
    let variance = diffs.iter().map(|d| (avg - d).powi(2)).sum::<f64>() / n;
    Ok(variance.sqrt())
}

enum SampleState {
    Empty,
    Computing,
    Ready(Arc<Sample>),
}

/// Per-image sample cache allowing exactly one computation in flight.
pub(crate) struct SampleCell {
    state: Mutex<SampleState>,
    ready: Condvar,
}

impl SampleCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SampleState::Empty),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<Sample>> {
        match &*self.state.lock() {
            SampleState::Ready(sample) => Some(Arc::clone(sample)),
            _ => None,
        }
    }

    /// Return the cached sample, computing it if nobody has. Callers that
    /// arrive while another thread computes wait for that result. A failed
    /// computation leaves the cell empty so the next caller retries.
    pub(crate) fn get_or_compute<F>(&self, compute: F) -> Result<Arc<Sample>>
    where
        F: FnOnce() -> Result<Sample>,
    {
        let mut state = self.state.lock();
        loop {
            if let SampleState::Ready(sample) = &*state {
                return Ok(Arc::clone(sample));
            }
            if matches!(*state, SampleState::Computing) {
                self.ready.wait(&mut state);
                continue;
            }
            break;
        }
        *state = SampleState::Computing;
        drop(state);

        let mut in_flight = InFlight { cell: self, settled: false };
        let sample = Arc::new(compute()?);
        *self.state.lock() = SampleState::Ready(Arc::clone(&sample));
        in_flight.settled = true;
        self.ready.notify_all();
        Ok(sample)
    }
}

/// Resets a cell stuck in `Computing` when the computation errors or panics.
struct InFlight<'a> {
    cell: &'a SampleCell,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.cell.state.lock() = SampleState::Empty;
            self.cell.ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::ColorMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn rects(bounds: &[(u32, u32, u32, u32)]) -> Vec<Rect> {
        bounds.iter().map(|&(l, t, r, b)| Rect::new(l, t, r, b)).collect()
    }

    #[test]
    fn split_line_cases() {
        assert_eq!(split_line(50), vec![(0, 50)]);
        assert_eq!(split_line(100), vec![(0, 100)]);
        assert_eq!(split_line(149), vec![(0, 149)]);
        assert_eq!(split_line(150), vec![(0, 75), (75, 150)]);
        assert_eq!(split_line(305), vec![(0, 101), (101, 202), (202, 305)]);
        assert_eq!(split_line(0), vec![(0, 0)]);
    }

    #[test]
    fn halves_round_to_even() {
        assert_eq!(segment_count(150), 2);
        assert_eq!(segment_count(250), 2);
        assert_eq!(segment_count(350), 4);
        assert_eq!(segment_count(351), 4);
    }

    #[test]
    fn split_line_covers_every_length() {
        for length in 1..1000 {
            let segments = split_line(length);
            assert_eq!(segments[0].0, 0);
            assert_eq!(segments.last().unwrap().1, length);
            assert!(segments.iter().all(|(a, b)| b > a));
            assert!(segments.windows(2).all(|w| w[0].1 == w[1].0));
            assert_eq!(segments.iter().map(|(a, b)| b - a).sum::<u32>(), length);
        }
    }

    #[test]
    fn split_rect_cases() {
        assert_eq!(split_rect(50, 50), rects(&[(0, 0, 50, 50)]));
        assert_eq!(split_rect(100, 50), rects(&[(0, 0, 100, 50)]));
        assert_eq!(
            split_rect(149, 150),
            rects(&[(0, 0, 149, 75), (0, 75, 149, 150)])
        );
        assert_eq!(
            split_rect(150, 249),
            rects(&[(0, 0, 75, 124), (75, 0, 150, 124), (0, 124, 75, 249), (75, 124, 150, 249)])
        );
        assert_eq!(
            split_rect(150, 305),
            rects(&[
                (0, 0, 75, 101),
                (75, 0, 150, 101),
                (0, 101, 75, 202),
                (75, 101, 150, 202),
                (0, 202, 75, 305),
                (75, 202, 150, 305),
            ])
        );
    }

    /// 80x60 gray ramp where pixel (x, y) = x + y.
    fn ramp() -> Vec<u8> {
        (0..60u32)
            .flat_map(|y| (0..80u32).map(move |x| (x + y) as u8))
            .collect()
    }

    #[test]
    fn block_sums() {
        let data = ramp();
        let cases = [
            ((0, 0, 80, 60), 331_200),
            ((0, 0, 40, 30), 40_800),
            ((40, 0, 80, 30), 88_800),
            ((0, 30, 40, 60), 76_800),
            ((40, 30, 80, 60), 124_800),
            ((0, 0, 80, 30), 129_600),
            ((40, 0, 80, 60), 213_600),
            ((20, 15, 60, 45), 82_800),
        ];
        for ((l, t, r, b), expected) in cases {
            let sums = sample_block(&data, 80, 1, Rect::new(l, t, r, b)).unwrap();
            assert_eq!(sums, vec![expected], "block ({l}, {t}, {r}, {b})");
        }
    }

    #[test]
    fn block_sums_per_channel() {
        // Three channels holding v, v + 1 and v + 2.
        let data: Vec<u8> = ramp().into_iter().flat_map(|v| [v, v + 1, v + 2]).collect();
        let sums = sample_block(&data, 80, 3, Rect::new(0, 0, 40, 30)).unwrap();
        assert_eq!(sums, vec![40_800, 40_800 + 1200, 40_800 + 2400]);
    }

    #[test]
    fn block_outside_buffer_is_rejected() {
        let data = ramp();
        assert!(sample_block(&data, 80, 1, Rect::new(0, 0, 81, 10)).is_err());
        assert!(sample_block(&data, 80, 1, Rect::new(0, 0, 80, 61)).is_err());
    }

    #[test]
    fn pooled_sample_matches_serial_sums() {
        let pool = WorkerPool::fixed(3);
        let (width, height) = (250u32, 160u32);
        let data: Vec<u8> = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
        let pixels = Arc::new(Pixels::new(ColorMode::Rgb, width, height, data).unwrap());

        let sample = compute_sample(Arc::clone(&pixels), &pool).unwrap();
        let expected: Vec<Vec<u64>> = split_rect(width, height)
            .into_iter()
            .map(|rect| sample_block(&pixels.data, width, 3, rect).unwrap())
            .collect();
        assert_eq!(sample.blocks(), expected.as_slice());
        assert_eq!(dissimilarity(&sample, &sample).unwrap(), 0.0);
    }

    #[test]
    fn gray_alpha_cannot_be_sampled() {
        let pool = WorkerPool::fixed(1);
        let pixels = Arc::new(Pixels::new(ColorMode::GrayAlpha, 2, 2, vec![0; 8]).unwrap());
        assert!(matches!(
            compute_sample(pixels, &pool),
            Err(HcgError::UnsupportedMode(ColorMode::GrayAlpha))
        ));
    }

    #[test]
    fn failing_block_task_fails_the_whole_sample() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let pool = WorkerPool::builder()
            .size(2)
            .on_error(Arc::new(move |_worker: &str, _failure: &crate::pool::TaskFailure| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build();

        // Claims 300 rows but only holds 150: the 3x3 grid's lower two rows
        // of blocks run past the buffer inside their tasks.
        let truncated = Arc::new(Pixels {
            mode: ColorMode::Rgb,
            width: 300,
            height: 300,
            data: vec![7; 300 * 150 * 3],
        });
        assert!(matches!(
            compute_sample(truncated, &pool),
            Err(HcgError::ShapeMismatch(_))
        ));

        // The pool keeps its workers and samples the next image normally.
        let whole = Arc::new(Pixels::new(ColorMode::Gray, 10, 10, vec![1; 100]).unwrap());
        let sample = compute_sample(whole, &pool).unwrap();
        assert_eq!(sample.blocks(), &[vec![100u64]]);

        pool.shutdown();
        pool.join();
        assert_eq!(failures.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn dissimilarity_is_std_dev_of_differences() {
        let a = Sample::from_blocks(vec![vec![10, 20], vec![30, 40]]);
        let shifted = Sample::from_blocks(vec![vec![15, 25], vec![35, 45]]);
        // A constant offset has no spread.
        assert_eq!(dissimilarity(&a, &shifted).unwrap(), 0.0);

        let b = Sample::from_blocks(vec![vec![10, 20], vec![30, 48]]);
        // Differences 0, 0, 0, -8: mean -2, variance (4 + 4 + 4 + 36) / 4 = 12.
        let score = dissimilarity(&a, &b).unwrap();
        assert!((score - 12f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn dissimilarity_requires_matching_shapes() {
        let a = Sample::from_blocks(vec![vec![1, 2, 3]]);
        let b = Sample::from_blocks(vec![vec![1, 2, 3, 4]]);
        assert!(matches!(dissimilarity(&a, &b), Err(HcgError::ShapeMismatch(_))));
    }

    #[test]
    fn concurrent_requesters_share_one_computation() {
        let cell = Arc::new(SampleCell::new());
        let computations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let computations = Arc::clone(&computations);
                thread::spawn(move || {
                    cell.get_or_compute(|| {
                        computations.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(Sample::from_blocks(vec![vec![7]]))
                    })
                    .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().blocks(), &[vec![7]]);
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert!(cell.get().is_some());
    }

    #[test]
    fn failed_computation_leaves_cell_retryable() {
        let cell = SampleCell::new();
        assert!(cell
            .get_or_compute(|| Err(HcgError::Pool("boom".into())))
            .is_err());
        assert!(cell.get().is_none());
        let sample = cell.get_or_compute(|| Ok(Sample::from_blocks(vec![vec![1]]))).unwrap();
        assert_eq!(sample.blocks(), &[vec![1]]);
    }
}
