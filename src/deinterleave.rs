//! Deinterleave stage: raw frame in, one FLIm and one OCT sub-frame out.
//!
//! Per raw frame:
//! 1. acquire one FLIm and one OCT buffer (stall on backpressure)
//! 2. split the raw frame, applying each modality's intra-frame rotation
//! 3. release the raw buffer
//! 4. hand both sub-frames to the recorder tap (copy, only while recording)
//! 5. pair through the inter-frame delay line and emit the pair

use crate::config::SyncConfig;
use crate::error::{AppResult, PipelineError};
use crate::frame::{FrameGeometry, RawLayout, Sample, Tagged};
use crate::recording::Recorder;
use crate::stage::{acquire_output, FrameToken, StopSignal, Transform};
use crate::sync::{rotate_alines, InterFrameSync};
use frame_pool::BufferPool;
use tracing::{debug, trace};

/// Split `raw` into rotated FLIm and OCT sub-frames.
///
/// Sub-frame A-line `a` comes from raw A-line `(a + offset) mod alines`.
pub fn split_frame<T: Copy>(
    geometry: &FrameGeometry,
    sync: &SyncConfig,
    raw: &[T],
    flim: &mut [T],
    oct: &mut [T],
) {
    let alines = geometry.alines_per_frame;
    let (flim_width, oct_width) = (geometry.flim_samples_per_aline, geometry.oct_samples_per_aline);

    match geometry.raw_layout {
        RawLayout::Concatenated => {
            let (raw_flim, raw_oct) = raw.split_at(geometry.flim_frame_len());
            rotate_alines(raw_flim, flim, flim_width, sync.flim_intra_offset);
            rotate_alines(raw_oct, oct, oct_width, sync.oct_intra_offset);
        }
        RawLayout::Interleaved => {
            let stride = flim_width + oct_width;
            for a in 0..alines {
                let src = ((a + sync.flim_intra_offset) % alines) * stride;
                flim[a * flim_width..(a + 1) * flim_width]
                    .copy_from_slice(&raw[src..src + flim_width]);

                let src = ((a + sync.oct_intra_offset) % alines) * stride + flim_width;
                oct[a * oct_width..(a + 1) * oct_width]
                    .copy_from_slice(&raw[src..src + oct_width]);
            }
        }
    }
}

/// Transform run by the deinterleave stage.
pub struct Deinterleave<T> {
    geometry: FrameGeometry,
    sync: SyncConfig,
    flim_pool: BufferPool<T>,
    oct_pool: BufferPool<T>,
    pairing: InterFrameSync<T>,
    recorder: Option<Recorder<T>>,
    abort: Option<StopSignal>,
    paired: u64,
}

impl<T: Sample> Deinterleave<T> {
    /// Deinterleaver writing into `flim_pool` and `oct_pool`.
    pub fn new(
        geometry: FrameGeometry,
        sync: SyncConfig,
        flim_pool: BufferPool<T>,
        oct_pool: BufferPool<T>,
    ) -> Self {
        let pairing = InterFrameSync::new(sync.inter_frame_offset);
        Self {
            geometry,
            sync,
            flim_pool,
            oct_pool,
            pairing,
            recorder: None,
            abort: None,
            paired: 0,
        }
    }

    /// Copy sub-frames into `recorder` while it is recording.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Recorder<T>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Stop waiting for sub-frame buffers once `abort` is requested.
    #[must_use]
    pub fn with_abort(mut self, abort: StopSignal) -> Self {
        self.abort = Some(abort);
        self
    }
}

impl<T: Sample> Transform for Deinterleave<T> {
    type Input = FrameToken<T>;
    type Output = (FrameToken<T>, FrameToken<T>);

    fn transform(
        &mut self,
        input: Self::Input,
        emit: &mut dyn FnMut(Self::Output),
    ) -> AppResult<()> {
        let expected = self.geometry.raw_frame_len();
        if input.data.len() != expected {
            return Err(PipelineError::FrameSize {
                expected: expected * T::BYTES,
                actual: input.data.len() * T::BYTES,
            });
        }

        let unavailable = |pool: &str| {
            PipelineError::Stage("deinterleave".to_string(), format!("{pool} pool unavailable"))
        };
        let abort = self.abort.as_ref();
        let mut flim = acquire_output(&self.flim_pool, abort).ok_or_else(|| unavailable("flim"))?;
        let mut oct = acquire_output(&self.oct_pool, abort).ok_or_else(|| unavailable("oct"))?;

        split_frame(&self.geometry, &self.sync, &input.data, &mut flim, &mut oct);
        trace!(frame = input.index, "Frame deinterleaved");
        drop(input);

        if let Some(recorder) = &self.recorder {
            recorder.capture(&flim, &oct);
        }

        if let Some(pair) = self.pairing.push(flim, oct) {
            let index = self.paired;
            self.paired += 1;
            emit((Tagged::new(index, pair.flim), Tagged::new(index, pair.oct)));
        }
        Ok(())
    }

    fn finish(&mut self) {
        let released = self.pairing.flush();
        debug!(
            pairs = self.paired,
            skipped = self.pairing.skipped(),
            released,
            "Inter-frame delay line flushed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(layout: RawLayout) -> FrameGeometry {
        FrameGeometry {
            alines_per_frame: 3,
            flim_samples_per_aline: 2,
            oct_samples_per_aline: 1,
            raw_layout: layout,
        }
    }

    #[test]
    fn test_split_interleaved_with_rotation() {
        // A-line a: flim [10a, 10a+1], oct [100+a]
        let raw = [0, 1, 100, 10, 11, 101, 20, 21, 102];
        let sync = SyncConfig {
            flim_intra_offset: 1,
            oct_intra_offset: 2,
            inter_frame_offset: 0,
        };
        let mut flim = [0; 6];
        let mut oct = [0; 3];
        split_frame(&geometry(RawLayout::Interleaved), &sync, &raw, &mut flim, &mut oct);
        assert_eq!(flim, [10, 11, 20, 21, 0, 1]);
        assert_eq!(oct, [102, 100, 101]);
    }

    #[test]
    fn test_split_concatenated_matches_interleaved() {
        let sync = SyncConfig {
            flim_intra_offset: 2,
            oct_intra_offset: 1,
            inter_frame_offset: 0,
        };
        let interleaved = [0, 1, 100, 10, 11, 101, 20, 21, 102];
        let concatenated = [0, 1, 10, 11, 20, 21, 100, 101, 102];

        let (mut fa, mut oa) = ([0; 6], [0; 3]);
        let (mut fb, mut ob) = ([0; 6], [0; 3]);
        split_frame(&geometry(RawLayout::Interleaved), &sync, &interleaved, &mut fa, &mut oa);
        split_frame(&geometry(RawLayout::Concatenated), &sync, &concatenated, &mut fb, &mut ob);
        assert_eq!((fa, oa), (fb, ob));
    }

    #[test]
    fn test_wrong_raw_size_is_rejected() {
        let geometry = geometry(RawLayout::Interleaved);
        let raw = BufferPool::<u16>::allocate("raw", 4, 1).unwrap();
        let flim = BufferPool::<u16>::allocate("flim", 6, 2).unwrap();
        let oct = BufferPool::<u16>::allocate("oct", 3, 2).unwrap();
        let mut stage = Deinterleave::new(geometry, SyncConfig::disabled(), flim.clone(), oct);

        let token = Tagged::new(0, raw.acquire().unwrap());
        let result = stage.transform(token, &mut |_| panic!("nothing emitted"));
        assert!(matches!(result, Err(PipelineError::FrameSize { .. })));
        assert_eq!(raw.available(), 1);
        assert_eq!(flim.available(), 2);
    }

    #[test]
    fn test_abort_releases_stall_on_exhausted_pool() {
        let geometry = geometry(RawLayout::Interleaved);
        let raw = BufferPool::<u16>::allocate("raw", geometry.raw_frame_len(), 1).unwrap();
        let flim = BufferPool::<u16>::allocate("flim", 6, 1).unwrap();
        let oct = BufferPool::<u16>::allocate("oct", 3, 1).unwrap();
        let abort = StopSignal::new();
        let mut stage = Deinterleave::new(geometry, SyncConfig::disabled(), flim.clone(), oct)
            .with_abort(abort.clone());

        let _held = flim.acquire().unwrap();
        abort.request();
        let token = Tagged::new(0, raw.acquire().unwrap());
        let result = stage.transform(token, &mut |_| panic!("nothing emitted"));
        assert!(matches!(result, Err(PipelineError::Stage(..))));
        assert_eq!(raw.available(), 1);
    }
}
