//! Acquisition: the pull stage and the hardware callback producer.
//!
//! Raw frames enter the pipeline in one of two ways:
//!
//! - **Pull**: [`spawn_acquisition`] runs a dedicated thread that reads a
//!   [`FrameSource`] (recorded file, simulated digitizer, in-memory frames)
//!   into raw pool buffers.
//! - **Callback**: a vendor driver thread calls
//!   [`CallbackProducer::on_transfer`] once per completed transfer. The
//!   driver recycles its block as soon as the call returns, so the bytes are
//!   copied into a pool buffer before returning.
//!
//! Either way the raw pool is the only memory frames are written into, so an
//! exhausted pool stalls the producer instead of dropping or allocating.

use crate::error::{AppResult, PipelineError};
use crate::frame::{decode_samples, FrameGeometry, RawLayout, Sample, Tagged};
use crate::stage::{
    acquire_output, Emit, FrameToken, SentinelGuard, StageHandle, StageReport, StopSignal,
};
use crate::status::StatusSink;
use frame_pool::{BufferPool, HandoffQueue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// A pull-mode producer of raw frames.
pub trait FrameSource<T>: Send {
    /// Fill `dst` with the next raw frame.
    ///
    /// Returns the frame index, or `None` at end of input. `dst` is a whole
    /// raw pool buffer.
    fn read_frame(&mut self, dst: &mut [T]) -> AppResult<Option<u64>>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// A non-fatal notice the source wants surfaced to the operator.
    fn take_warning(&mut self) -> Option<String> {
        None
    }
}

/// Frames and leftover bytes in a recorded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedExtent {
    /// Complete frames.
    pub frames: u64,
    /// Bytes after the last complete frame.
    pub trailing_bytes: u64,
}

impl RecordedExtent {
    /// Extent of a file of `file_size` bytes.
    #[must_use]
    pub fn from_size(file_size: u64, frame_bytes: usize) -> Self {
        let frame_bytes = frame_bytes.max(1) as u64;
        Self {
            frames: file_size / frame_bytes,
            trailing_bytes: file_size % frame_bytes,
        }
    }

    /// Inspect the file at `path`.
    pub fn of_file<T: Sample>(path: &Path, geometry: &FrameGeometry) -> AppResult<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self::from_size(size, geometry.recorded_frame_bytes::<T>()))
    }
}

/// Replays a recorded file of concatenated frames.
///
/// Frame size comes from the companion configuration; the file carries no
/// header. A trailing partial frame is skipped and reported once.
pub struct FileFrameSource<T> {
    path: PathBuf,
    reader: BufReader<File>,
    extent: RecordedExtent,
    next: u64,
    scratch: Vec<u8>,
    warning: Option<String>,
    _sample: PhantomData<T>,
}

impl<T: Sample> FileFrameSource<T> {
    /// Open `path` for replay with `geometry`.
    pub fn open(path: impl AsRef<Path>, geometry: &FrameGeometry) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let extent = RecordedExtent::of_file::<T>(&path, geometry)?;
        let file = File::open(&path)?;

        let warning = (extent.trailing_bytes > 0).then(|| {
            format!(
                "{} ends with a partial frame ({} bytes ignored)",
                path.display(),
                extent.trailing_bytes
            )
        });
        info!(
            path = %path.display(),
            frames = extent.frames,
            trailing_bytes = extent.trailing_bytes,
            "Opened recording for replay"
        );

        Ok(Self {
            path,
            reader: BufReader::new(file),
            extent,
            next: 0,
            scratch: vec![0; geometry.recorded_frame_bytes::<T>()],
            warning,
            _sample: PhantomData,
        })
    }

    /// Complete frames in the file.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.extent.frames
    }
}

impl<T: Sample> FrameSource<T> for FileFrameSource<T> {
    fn read_frame(&mut self, dst: &mut [T]) -> AppResult<Option<u64>> {
        if self.next >= self.extent.frames {
            return Ok(None);
        }
        let expected = dst.len() * T::BYTES;
        if expected != self.scratch.len() {
            return Err(PipelineError::FrameSize {
                expected,
                actual: self.scratch.len(),
            });
        }
        self.reader.read_exact(&mut self.scratch)?;
        decode_samples(&self.scratch, dst);
        self.next += 1;
        Ok(Some(self.next - 1))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn take_warning(&mut self) -> Option<String> {
        self.warning.take()
    }
}

/// In-memory frames, replayed once in order.
#[derive(Debug, Default)]
pub struct VecSource<T> {
    frames: VecDeque<Vec<T>>,
    next: u64,
}

impl<T: Sample> VecSource<T> {
    /// Source yielding `frames` in order.
    pub fn new(frames: impl IntoIterator<Item = Vec<T>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            next: 0,
        }
    }
}

impl<T: Sample> FrameSource<T> for VecSource<T> {
    fn read_frame(&mut self, dst: &mut [T]) -> AppResult<Option<u64>> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;
        if frame.len() != dst.len() {
            return Err(PipelineError::FrameSize {
                expected: dst.len() * T::BYTES,
                actual: frame.len() * T::BYTES,
            });
        }
        dst.copy_from_slice(&frame);
        Ok(Some(index))
    }

    fn describe(&self) -> String {
        format!("{} in-memory frames", self.frames.len())
    }
}

/// Synthetic FLIm pulses and OCT fringes.
///
/// Each FLIm channel window holds a baseline followed by an exponential decay
/// whose amplitude varies around the rotation; each OCT A-line holds a
/// fringe whose frequency encodes a slowly moving lumen depth. Noise comes
/// from a seeded RNG, so runs are reproducible.
pub struct SimulatedDigitizer {
    geometry: FrameGeometry,
    channels: usize,
    baseline_samples: usize,
    noise_amplitude: u16,
    rng: StdRng,
    frame_period: Option<Duration>,
    next_deadline: Option<Instant>,
    frame_limit: Option<u64>,
    next: u64,
}

/// DC level of the simulated digitizer.
const BASELINE_LEVEL: f32 = 400.0;

impl SimulatedDigitizer {
    /// Simulated digitizer for `geometry`.
    #[must_use]
    pub fn new(
        geometry: FrameGeometry,
        channels: usize,
        baseline_samples: usize,
        seed: u64,
    ) -> Self {
        Self {
            geometry,
            channels: channels.max(1),
            baseline_samples,
            noise_amplitude: 0,
            rng: StdRng::seed_from_u64(seed),
            frame_period: None,
            next_deadline: None,
            frame_limit: None,
            next: 0,
        }
    }

    /// Build from the pipeline configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        let mut source = Self::new(
            config.frame,
            config.processing.flim_channels,
            config.processing.flim_baseline_samples,
            config.source.seed,
        )
        .with_noise(config.source.noise_amplitude);
        if config.source.frame_rate_hz > 0.0 {
            source = source.with_frame_rate(config.source.frame_rate_hz);
        }
        source
    }

    /// Peak-to-peak noise added to every sample.
    #[must_use]
    pub fn with_noise(mut self, amplitude: u16) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Pace frames at `hz` instead of running as fast as buffers allow.
    #[must_use]
    pub fn with_frame_rate(mut self, hz: f64) -> Self {
        self.frame_period = (hz > 0.0).then(|| Duration::from_secs_f64(1.0 / hz));
        self
    }

    /// Stop after `frames` frames.
    #[must_use]
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    fn noise(&mut self) -> f32 {
        if self.noise_amplitude == 0 {
            return 0.0;
        }
        let half = f32::from(self.noise_amplitude) / 2.0;
        self.rng.gen_range(-half..=half)
    }

    fn fill_flim(&mut self, frame: u64, aline: usize, dst: &mut [u16]) {
        let window = dst.len() / self.channels;
        let angle = aline as f32 / self.geometry.alines_per_frame as f32 * std::f32::consts::TAU;
        for (channel, samples) in dst.chunks_mut(window.max(1)).enumerate() {
            let amplitude = 2_000.0 * (1.0 + 0.5 * (angle + frame as f32 * 0.01).sin())
                / (channel + 1) as f32;
            let tau = 2.0 + channel as f32;
            for (i, sample) in samples.iter_mut().enumerate() {
                let pulse = if i >= self.baseline_samples {
                    amplitude * (-((i - self.baseline_samples) as f32) / tau).exp()
                } else {
                    0.0
                };
                *sample = clamp_u16(BASELINE_LEVEL + pulse + self.noise());
            }
        }
    }

    fn fill_oct(&mut self, frame: u64, aline: usize, dst: &mut [u16]) {
        let depth = 0.05 + 0.02 * ((frame as f32 * 0.05) + aline as f32 * 0.001).sin();
        for (i, sample) in dst.iter_mut().enumerate() {
            let fringe = 1_500.0 * (i as f32 * depth * std::f32::consts::TAU).cos();
            *sample = clamp_u16(2_048.0 + fringe + self.noise());
        }
    }

    fn pace(&mut self) {
        let Some(period) = self.frame_period else {
            return;
        };
        let deadline = self.next_deadline.unwrap_or_else(Instant::now);
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + period);
    }
}

fn clamp_u16(value: f32) -> u16 {
    value.round().clamp(0.0, f32::from(u16::MAX)) as u16
}

impl FrameSource<u16> for SimulatedDigitizer {
    fn read_frame(&mut self, dst: &mut [u16]) -> AppResult<Option<u64>> {
        if self.frame_limit.is_some_and(|limit| self.next >= limit) {
            return Ok(None);
        }
        let geometry = self.geometry;
        if dst.len() != geometry.raw_frame_len() {
            return Err(PipelineError::FrameSize {
                expected: geometry.raw_frame_len() * 2,
                actual: dst.len() * 2,
            });
        }
        self.pace();

        let frame = self.next;
        let (flim_len, oct_len) = (geometry.flim_samples_per_aline, geometry.oct_samples_per_aline);
        match geometry.raw_layout {
            RawLayout::Interleaved => {
                for (aline, block) in dst.chunks_exact_mut(flim_len + oct_len).enumerate() {
                    let (flim, oct) = block.split_at_mut(flim_len);
                    self.fill_flim(frame, aline, flim);
                    self.fill_oct(frame, aline, oct);
                }
            }
            RawLayout::Concatenated => {
                let (flim, oct) = dst.split_at_mut(geometry.flim_frame_len());
                for (aline, block) in flim.chunks_exact_mut(flim_len).enumerate() {
                    self.fill_flim(frame, aline, block);
                }
                for (aline, block) in oct.chunks_exact_mut(oct_len).enumerate() {
                    self.fill_oct(frame, aline, block);
                }
            }
        }

        self.next += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!(
            "simulated digitizer ({} A-lines, seed-driven noise {})",
            self.geometry.alines_per_frame, self.noise_amplitude
        )
    }
}

/// Spawn the pull acquisition stage.
///
/// Reads `source` into buffers from `pool` and pushes them to `output` until
/// the source ends, a stop is requested, or the source fails. Warning-level
/// failures drop that frame; anything worse ends acquisition. All exits push
/// the sentinel.
pub fn spawn_acquisition<T: Sample>(
    name: &str,
    mut source: Box<dyn FrameSource<T>>,
    pool: BufferPool<T>,
    mut output: HandoffQueue<FrameToken<T>>,
    stop: StopSignal,
    status: Arc<dyn StatusSink>,
) -> AppResult<StageHandle> {
    let stage = name.to_string();
    StageHandle::spawn(name, move || {
        let span = info_span!("stage", stage = %stage);
        let _enter = span.enter();
        let mut report = StageReport::new(&stage);
        let _sentinel = SentinelGuard::new(output.clone());
        info!(source = %source.describe(), "Acquisition started");

        loop {
            if stop.is_requested() {
                debug!("Stop requested");
                break;
            }
            let Some(mut buffer) = acquire_output(&pool, Some(&stop)) else {
                break;
            };

            let read = source.read_frame(&mut buffer);
            if let Some(notice) = source.take_warning() {
                warn!("{notice}");
                status.warning(&stage, notice);
            }

            match read {
                Ok(Some(index)) => {
                    report.frames_in += 1;
                    output.emit(Tagged::new(index, buffer));
                    report.frames_out += 1;
                }
                Ok(None) => {
                    info!("Source exhausted");
                    break;
                }
                Err(err) if err.severity() == crate::status::Severity::Warning => {
                    report.frames_in += 1;
                    report.frames_dropped += 1;
                    warn!(error = %err, "Frame dropped");
                    status.warning(&stage, format!("frame dropped: {err}"));
                }
                Err(err) => {
                    error!(error = %err, "Acquisition aborted");
                    status.error(&stage, format!("acquisition aborted: {err}"));
                    break;
                }
            }
        }

        output.close();
        info!(
            frames = report.frames_out,
            dropped = report.frames_dropped,
            "Acquisition finished"
        );
        report
    })
}

/// Producer side of the hardware callback contract.
///
/// Call [`on_transfer`](Self::on_transfer) from the driver's callback and
/// [`finish`](Self::finish) when acquisition ends. Dropping the producer
/// also finishes it, so downstream stages always see the sentinel.
pub struct CallbackProducer<T> {
    pool: BufferPool<T>,
    output: HandoffQueue<FrameToken<T>>,
    status: Arc<dyn StatusSink>,
    delivered: u64,
    rejected: u64,
}

impl<T: Sample> CallbackProducer<T> {
    /// Producer writing into `pool` and pushing to `output`.
    pub fn new(
        pool: BufferPool<T>,
        output: HandoffQueue<FrameToken<T>>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            pool,
            output,
            status,
            delivered: 0,
            rejected: 0,
        }
    }

    /// Bytes the driver must deliver per transfer.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.pool.elements_per_buffer() * T::BYTES
    }

    /// Accept one completed hardware transfer.
    ///
    /// Copies `raw` (little-endian samples) into a pool buffer before
    /// returning, stalling while the raw pool is exhausted.
    ///
    /// # Errors
    ///
    /// [`PipelineError::FrameSize`] if `raw` is not exactly one frame;
    /// [`PipelineError::InvalidState`] after [`finish`](Self::finish).
    pub fn on_transfer(&mut self, frame_index: u64, raw: &[u8]) -> AppResult<()> {
        if self.output.is_draining() {
            return Err(Self::finished());
        }

        let expected = self.frame_bytes();
        if raw.len() != expected {
            self.rejected += 1;
            let err = PipelineError::FrameSize {
                expected,
                actual: raw.len(),
            };
            warn!(frame = frame_index, error = %err, "Transfer rejected");
            self.status
                .warning("acquisition", format!("transfer {frame_index} rejected: {err}"));
            return Err(err);
        }

        let Some(mut buffer) = acquire_output(&self.pool, None) else {
            return Err(PipelineError::Stage(
                "acquisition".to_string(),
                "raw pool unavailable".to_string(),
            ));
        };
        decode_samples(raw, &mut buffer);
        // The sentinel may have been pushed while we stalled
        self.output
            .push(Tagged::new(frame_index, buffer))
            .map_err(|_| Self::finished())?;
        self.delivered += 1;
        Ok(())
    }

    fn finished() -> PipelineError {
        PipelineError::InvalidState {
            operation: "accept transfers",
            state: "acquisition finished".to_string(),
        }
    }

    /// Transfers accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Transfers rejected for size.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// End acquisition: push the sentinel.
    pub fn finish(&mut self) {
        if self.output.close() {
            info!(
                delivered = self.delivered,
                rejected = self.rejected,
                "Callback acquisition finished"
            );
        }
    }
}

impl<T> Drop for CallbackProducer<T> {
    fn drop(&mut self) {
        if !self.output.is_draining() {
            self.output.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_samples;
    use crate::status::{MemorySink, Severity};
    use std::io::Write;

    fn geometry() -> FrameGeometry {
        FrameGeometry {
            alines_per_frame: 4,
            flim_samples_per_aline: 4,
            oct_samples_per_aline: 2,
            raw_layout: RawLayout::Concatenated,
        }
    }

    #[test]
    fn test_file_source_reports_partial_frame() {
        let geometry = geometry();
        let frame_len = geometry.recorded_frame_len();
        let mut bytes = Vec::new();
        for frame in 0..3u16 {
            encode_samples(&vec![frame; frame_len], &mut bytes);
        }
        bytes.extend_from_slice(&[0xAA; 5]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let mut source = FileFrameSource::<u16>::open(file.path(), &geometry).unwrap();
        assert_eq!(source.frame_count(), 3);
        assert!(source.take_warning().unwrap().contains("5 bytes"));
        assert!(source.take_warning().is_none());

        let mut dst = vec![0u16; frame_len];
        for expected in 0..3u16 {
            assert_eq!(source.read_frame(&mut dst).unwrap(), Some(u64::from(expected)));
            assert!(dst.iter().all(|&s| s == expected));
        }
        assert_eq!(source.read_frame(&mut dst).unwrap(), None);
    }

    #[test]
    fn test_simulated_digitizer_is_deterministic() {
        let geometry = FrameGeometry {
            raw_layout: RawLayout::Interleaved,
            ..geometry()
        };
        let mut a = SimulatedDigitizer::new(geometry, 2, 1, 7).with_noise(10).with_frame_limit(2);
        let mut b = SimulatedDigitizer::new(geometry, 2, 1, 7).with_noise(10);

        let mut fa = vec![0u16; geometry.raw_frame_len()];
        let mut fb = vec![0u16; geometry.raw_frame_len()];
        for _ in 0..2 {
            a.read_frame(&mut fa).unwrap();
            b.read_frame(&mut fb).unwrap();
            assert_eq!(fa, fb);
        }
        assert_eq!(a.read_frame(&mut fa).unwrap(), None);
    }

    #[test]
    fn test_acquisition_stage_drops_bad_frames_and_closes() {
        let geometry = geometry();
        let len = geometry.raw_frame_len();
        let pool = BufferPool::<u16>::allocate("raw", len, 2).unwrap();
        let queue = HandoffQueue::new("raw");
        let sink = Arc::new(MemorySink::new());

        let source = VecSource::new(vec![vec![1; len], vec![2; 3], vec![3; len]]);
        let handle = spawn_acquisition(
            "acquisition",
            Box::new(source),
            pool.clone(),
            queue.clone(),
            StopSignal::new(),
            sink.clone(),
        )
        .unwrap();

        let mut indices = Vec::new();
        while let Some(token) = queue.pop() {
            indices.push(token.index);
        }
        assert_eq!(indices, vec![0, 2]);

        let report = handle.join().unwrap();
        assert_eq!(report.frames_out, 2);
        assert_eq!(report.frames_dropped, 1);
        assert_eq!(sink.with_severity(Severity::Warning).len(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_callback_producer_copies_and_rejects() {
        let pool = BufferPool::<u16>::allocate("raw", 3, 2).unwrap();
        let queue = HandoffQueue::new("raw");
        let sink = Arc::new(MemorySink::new());
        let mut producer = CallbackProducer::new(pool.clone(), queue.clone(), sink.clone());
        assert_eq!(producer.frame_bytes(), 6);

        let mut driver_block = Vec::new();
        encode_samples(&[1u16, 2, 3], &mut driver_block);
        producer.on_transfer(41, &driver_block).unwrap();
        // The driver reuses its block immediately
        driver_block.fill(0);

        assert!(matches!(
            producer.on_transfer(42, &[0u8; 4]),
            Err(PipelineError::FrameSize { expected: 6, actual: 4 })
        ));
        producer.finish();
        assert!(matches!(
            producer.on_transfer(43, &[0u8; 6]),
            Err(PipelineError::InvalidState { .. })
        ));

        let token = queue.pop().unwrap();
        assert_eq!(token.index, 41);
        assert_eq!(&token.data[..], &[1, 2, 3]);
        assert!(queue.pop().is_none());
        assert_eq!(producer.delivered(), 1);
        assert_eq!(producer.rejected(), 1);
    }

    #[test]
    fn test_transfer_after_finish_is_refused_before_drain() {
        let pool = BufferPool::<u16>::allocate("raw", 2, 2).unwrap();
        let queue = HandoffQueue::new("raw");
        let mut producer =
            CallbackProducer::new(pool.clone(), queue.clone(), Arc::new(MemorySink::new()));
        let mut block = Vec::new();
        encode_samples(&[7u16, 8], &mut block);

        producer.finish();
        // Sentinel pushed but not yet consumed downstream
        assert!(queue.is_draining());
        assert!(!queue.is_closed());
        assert!(matches!(
            producer.on_transfer(0, &block),
            Err(PipelineError::InvalidState { .. })
        ));
        assert_eq!(producer.delivered(), 0);
        assert_eq!(pool.available(), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_transfer_refused_when_stop_closes_queue_during_stall() {
        let pool = BufferPool::<u16>::allocate("raw", 2, 1).unwrap();
        let queue = HandoffQueue::new("raw");
        let mut producer =
            CallbackProducer::new(pool.clone(), queue.clone(), Arc::new(MemorySink::new()));
        let mut block = Vec::new();
        encode_samples(&[7u16, 8], &mut block);

        let held = pool.acquire().unwrap();
        let closer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(80));
                queue.close();
                drop(held);
            })
        };
        assert!(producer.on_transfer(0, &block).is_err());
        closer.join().unwrap();
        assert_eq!(producer.delivered(), 0);
        assert_eq!(pool.available(), 1);
    }
}
