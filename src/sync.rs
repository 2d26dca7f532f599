//! Frame synchronization between the rotary encoder and both modalities.
//!
//! Two corrections, both fixed for an acquisition session:
//!
//! - **Intra-frame**: the A-line axis of a sub-frame is rotated circularly by
//!   a fixed offset, compensating the phase lag between the encoder
//!   reference and the digitizer trigger.
//! - **Inter-frame**: the two modalities reach the deinterleave stage with
//!   different latency. Live, [`InterFrameSync`] holds the leading
//!   modality's buffers in a delay line and discards the lagging modality's
//!   first frames. At save time the same offset is applied to the write
//!   order instead ([`rotate_index`]), because recorded frames are captured
//!   before live pairing.

use crate::frame::Modality;
use frame_pool::PoolBuffer;
use std::collections::VecDeque;
use tracing::trace;

/// Rotate the A-line axis of `src` into `dst`.
///
/// `dst[a] = src[(a + offset) mod alines]` for every A-line `a`, where each
/// A-line is `samples_per_aline` contiguous samples. `offset` must be smaller
/// than the A-line count; configuration validation guarantees it.
pub fn rotate_alines<T: Copy>(src: &[T], dst: &mut [T], samples_per_aline: usize, offset: usize) {
    debug_assert_eq!(src.len(), dst.len());
    let split = offset * samples_per_aline;
    debug_assert!(split < src.len() || src.is_empty());

    let tail = src.len() - split;
    dst[..tail].copy_from_slice(&src[split..]);
    dst[tail..].copy_from_slice(&src[..split]);
}

/// Save-time write-order rotation over `count` recorded frames.
///
/// `rotate_index(rotate_index(j, n, c), -n, c) == j` for any `n`.
#[must_use]
pub fn rotate_index(index: usize, offset: isize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let count = count as isize;
    (index as isize + offset).rem_euclid(count) as usize
}

/// Ring slots holding the FLIm and OCT halves of written frame `index`.
///
/// FLIm frame `j` belongs with the OCT frame recorded `offset` slots later
/// (earlier, for a negative offset), matching the live pairing. Slots wrap
/// around the ring, so every captured frame is written.
#[must_use]
pub fn write_pair(index: usize, inter_frame_offset: isize, count: usize) -> (usize, usize) {
    (index, rotate_index(index, inter_frame_offset, count))
}

/// A FLIm/OCT pair for one pullback position.
#[derive(Debug)]
pub struct SyncedPair<T> {
    /// FLIm sub-frame.
    pub flim: PoolBuffer<T>,
    /// OCT sub-frame.
    pub oct: PoolBuffer<T>,
}

/// Live inter-frame pairing.
///
/// With offset `N > 0` (OCT lags), FLIm frame `k` pairs with OCT frame
/// `k + N`: the last `N` FLIm buffers wait in the delay line and the first
/// `N` OCT buffers go straight back to their pool. The delay line keeps the
/// buffers on loan, so the leading pool must hold more than `N` buffers.
#[derive(Debug)]
pub struct InterFrameSync<T> {
    lag: usize,
    leading: Option<Modality>,
    delay: VecDeque<PoolBuffer<T>>,
    skipped: usize,
}

impl<T> InterFrameSync<T> {
    /// Pairing for `inter_frame_offset` (see [`crate::config::SyncConfig`]).
    #[must_use]
    pub fn new(inter_frame_offset: isize) -> Self {
        let leading = match inter_frame_offset {
            0 => None,
            n if n > 0 => Some(Modality::Flim),
            _ => Some(Modality::Oct),
        };
        let lag = inter_frame_offset.unsigned_abs();
        Self {
            lag,
            leading,
            delay: VecDeque::with_capacity(lag + 1),
            skipped: 0,
        }
    }

    /// Feed one frame of each modality; returns a pair once the delay line
    /// is primed.
    pub fn push(&mut self, flim: PoolBuffer<T>, oct: PoolBuffer<T>) -> Option<SyncedPair<T>> {
        let (held, lagging) = match self.leading {
            None => return Some(SyncedPair { flim, oct }),
            Some(Modality::Flim) => (flim, oct),
            Some(Modality::Oct) => (oct, flim),
        };

        self.delay.push_back(held);
        if self.delay.len() <= self.lag {
            // Lagging frame has no partner yet; dropping it returns it to its pool
            self.skipped += 1;
            trace!(skipped = self.skipped, lag = self.lag, "Inter-frame sync priming");
            drop(lagging);
            return None;
        }

        let held = self.delay.pop_front()?;
        Some(match self.leading {
            Some(Modality::Oct) => SyncedPair {
                flim: lagging,
                oct: held,
            },
            _ => SyncedPair {
                flim: held,
                oct: lagging,
            },
        })
    }

    /// Lagging-modality frames discarded while priming.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Buffers currently parked in the delay line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.delay.len()
    }

    /// Release every parked buffer back to its pool (end of stream).
    pub fn flush(&mut self) -> usize {
        let released = self.delay.len();
        self.delay.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_pool::BufferPool;

    #[test]
    fn test_rotate_alines() {
        // 4 A-lines of 2 samples each
        let src = [0, 0, 1, 1, 2, 2, 3, 3];
        let mut dst = [0; 8];
        rotate_alines(&src, &mut dst, 2, 1);
        assert_eq!(dst, [1, 1, 2, 2, 3, 3, 0, 0]);

        rotate_alines(&src, &mut dst, 2, 0);
        assert_eq!(dst, src);

        rotate_alines(&src, &mut dst, 2, 3);
        assert_eq!(dst, [3, 3, 0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_rotate_index_inverse() {
        for count in 1..12 {
            for offset in -5isize..=5 {
                for j in 0..count {
                    let there = rotate_index(j, offset, count);
                    assert!(there < count);
                    assert_eq!(rotate_index(there, -offset, count), j);
                }
            }
        }
    }

    #[test]
    fn test_write_pair_direction() {
        assert_eq!(write_pair(0, 2, 5), (0, 2));
        assert_eq!(write_pair(4, 2, 5), (4, 1));
        assert_eq!(write_pair(0, -2, 5), (0, 3));
        assert_eq!(write_pair(3, 0, 5), (3, 3));
    }

    fn stamped(pool: &BufferPool<u32>, value: u32) -> PoolBuffer<u32> {
        let mut buf = pool.acquire().unwrap();
        buf.fill(value);
        buf
    }

    #[test]
    fn test_inter_frame_oct_lags() {
        let flim_pool = BufferPool::<u32>::allocate("flim", 2, 4).unwrap();
        let oct_pool = BufferPool::<u32>::allocate("oct", 2, 4).unwrap();
        let mut sync = InterFrameSync::new(2);

        let mut pairs = Vec::new();
        for k in 0..6 {
            if let Some(pair) = sync.push(stamped(&flim_pool, k), stamped(&oct_pool, k)) {
                pairs.push((pair.flim[0], pair.oct[0]));
            }
        }

        // FLIm k pairs with OCT k+2; first two OCT frames skipped
        assert_eq!(pairs, vec![(0, 2), (1, 3), (2, 4), (3, 5)]);
        assert_eq!(sync.skipped(), 2);
        assert_eq!(sync.pending(), 2);
        assert_eq!(flim_pool.outstanding(), 2);
        assert_eq!(oct_pool.outstanding(), 0);

        assert_eq!(sync.flush(), 2);
        assert_eq!(flim_pool.available(), 4);
    }

    #[test]
    fn test_inter_frame_flim_lags() {
        let flim_pool = BufferPool::<u32>::allocate("flim", 2, 4).unwrap();
        let oct_pool = BufferPool::<u32>::allocate("oct", 2, 4).unwrap();
        let mut sync = InterFrameSync::new(-1);

        let mut pairs = Vec::new();
        for k in 0..4 {
            if let Some(pair) = sync.push(stamped(&flim_pool, k), stamped(&oct_pool, k)) {
                pairs.push((pair.flim[0], pair.oct[0]));
            }
        }
        assert_eq!(pairs, vec![(1, 0), (2, 1), (3, 2)]);
        assert_eq!(oct_pool.outstanding(), 1);
    }

    #[test]
    fn test_zero_offset_passes_through() {
        let pool = BufferPool::<u32>::allocate("p", 2, 4).unwrap();
        let mut sync = InterFrameSync::new(0);
        let pair = sync.push(stamped(&pool, 7), stamped(&pool, 9)).unwrap();
        assert_eq!((pair.flim[0], pair.oct[0]), (7, 9));
        assert_eq!(sync.skipped(), 0);
    }
}
