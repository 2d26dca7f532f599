//! Per-modality processing stages and the result writer.
//!
//! A processing stage pops a tagged sub-frame, runs its [`FrameEngine`] into
//! a parameter record taken from the result pool, commits the record to the
//! [`ResultMaps`] and raises frame completion, then forwards the record to
//! the optional result writer. Without a writer the record returns to its
//! pool immediately.

use crate::config::ProcessingConfig;
use crate::error::{AppResult, PipelineError};
use crate::frame::{encode_samples, FrameGeometry, Sample, Tagged};
use crate::results::ResultMaps;
use crate::stage::{acquire_output, FrameToken, StopSignal, Transform};
use frame_pool::BufferPool;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Numeric engine invoked once per frame.
///
/// `process` must be deterministic and write every element of `outputs`,
/// laid out map-major: map `m`, row `r` at `outputs[m * rows + r]`.
pub trait FrameEngine<T>: Send {
    /// Names of the maps this engine produces, in output order.
    fn outputs(&self) -> Vec<String>;

    /// Values per map per frame.
    fn rows(&self) -> usize;

    /// Process one sub-frame.
    fn process(&mut self, input: &[T], outputs: &mut [f32]) -> AppResult<()>;

    /// Length of one parameter record.
    fn record_len(&self) -> usize {
        self.outputs().len() * self.rows()
    }
}

/// Fluorescence pulse engine: per A-line and channel, baseline-corrected
/// intensity and a mean-delay lifetime estimate.
#[derive(Debug, Clone)]
pub struct FlimPulseEngine {
    alines: usize,
    samples_per_aline: usize,
    channels: usize,
    baseline_samples: usize,
    sample_interval_ns: f32,
}

impl FlimPulseEngine {
    /// Engine for `geometry` with the configured channel layout.
    #[must_use]
    pub fn new(geometry: &FrameGeometry, processing: &ProcessingConfig) -> Self {
        Self {
            alines: geometry.alines_per_frame,
            samples_per_aline: geometry.flim_samples_per_aline,
            channels: processing.flim_channels.max(1),
            baseline_samples: processing.flim_baseline_samples,
            sample_interval_ns: processing.sample_interval_ns,
        }
    }

    /// Intensity and lifetime (ns) of one channel window.
    fn analyze(&self, window: &[f32]) -> (f32, f32) {
        let baseline_len = self.baseline_samples.min(window.len());
        let baseline = if baseline_len == 0 {
            0.0
        } else {
            window[..baseline_len].iter().sum::<f32>() / baseline_len as f32
        };

        let signal = &window[baseline_len..];
        let peak = signal
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;

        let mut intensity = 0.0;
        let mut moment = 0.0;
        for (i, &value) in signal.iter().enumerate() {
            let corrected = (value - baseline).max(0.0);
            intensity += corrected;
            if i >= peak {
                moment += (i - peak) as f32 * corrected;
            }
        }
        let decay: f32 = signal[peak.min(signal.len())..]
            .iter()
            .map(|&v| (v - baseline).max(0.0))
            .sum();
        let lifetime = if decay > 0.0 {
            moment / decay * self.sample_interval_ns
        } else {
            0.0
        };
        (intensity, lifetime)
    }
}

impl<T: Sample> FrameEngine<T> for FlimPulseEngine {
    fn outputs(&self) -> Vec<String> {
        let intensity = (1..=self.channels).map(|ch| format!("intensity_ch{ch}"));
        let lifetime = (1..=self.channels).map(|ch| format!("lifetime_ch{ch}"));
        intensity.chain(lifetime).collect()
    }

    fn rows(&self) -> usize {
        self.alines
    }

    fn process(&mut self, input: &[T], outputs: &mut [f32]) -> AppResult<()> {
        let expected = self.alines * self.samples_per_aline;
        if input.len() != expected {
            return Err(PipelineError::Processing(format!(
                "FLIm frame has {} samples, expected {expected}",
                input.len()
            )));
        }

        let window = self.samples_per_aline / self.channels;
        let rows = self.alines;
        let mut scratch = vec![0.0f32; window];
        for (a, aline) in input.chunks_exact(self.samples_per_aline).enumerate() {
            for (ch, samples) in aline.chunks_exact(window).take(self.channels).enumerate() {
                for (dst, &sample) in scratch.iter_mut().zip(samples) {
                    *dst = sample.to_f32();
                }
                let (intensity, lifetime) = self.analyze(&scratch);
                outputs[ch * rows + a] = intensity;
                outputs[(self.channels + ch) * rows + a] = lifetime;
            }
        }
        Ok(())
    }
}

/// OCT engine: per A-line mean and peak of the fringe.
#[derive(Debug, Clone)]
pub struct OctProjectionEngine {
    alines: usize,
    samples_per_aline: usize,
}

impl OctProjectionEngine {
    /// Engine for `geometry`.
    #[must_use]
    pub fn new(geometry: &FrameGeometry) -> Self {
        Self {
            alines: geometry.alines_per_frame,
            samples_per_aline: geometry.oct_samples_per_aline,
        }
    }
}

impl<T: Sample> FrameEngine<T> for OctProjectionEngine {
    fn outputs(&self) -> Vec<String> {
        vec!["mean".to_string(), "peak".to_string()]
    }

    fn rows(&self) -> usize {
        self.alines
    }

    fn process(&mut self, input: &[T], outputs: &mut [f32]) -> AppResult<()> {
        if input.len() != self.alines * self.samples_per_aline {
            return Err(PipelineError::Processing(format!(
                "OCT frame has {} samples, expected {}",
                input.len(),
                self.alines * self.samples_per_aline
            )));
        }
        let (means, peaks) = outputs.split_at_mut(self.alines);
        for (a, aline) in input.chunks_exact(self.samples_per_aline).enumerate() {
            let (sum, peak) = aline.iter().fold((0.0f32, f32::MIN), |(sum, peak), &s| {
                let v = s.to_f32();
                (sum + v, peak.max(v))
            });
            means[a] = sum / self.samples_per_aline as f32;
            peaks[a] = peak;
        }
        Ok(())
    }
}

/// Transform run by a processing stage.
pub struct ProcessingStage<T> {
    engine: Box<dyn FrameEngine<T>>,
    results: Arc<ResultMaps>,
    records: BufferPool<f32>,
    abort: Option<StopSignal>,
}

impl<T: Sample> ProcessingStage<T> {
    /// Stage running `engine`, committing into `results`, drawing
    /// parameter records from `records`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] if the record pool or the maps do
    /// not match the engine's output shape.
    pub fn new(
        engine: Box<dyn FrameEngine<T>>,
        results: Arc<ResultMaps>,
        records: BufferPool<f32>,
    ) -> AppResult<Self> {
        if records.elements_per_buffer() != engine.record_len()
            || results.maps().len() != engine.outputs().len()
            || results.rows() != engine.rows()
        {
            return Err(PipelineError::Configuration(format!(
                "result buffers ({} values) do not match engine outputs ({} maps x {} rows)",
                records.elements_per_buffer(),
                engine.outputs().len(),
                engine.rows()
            )));
        }
        Ok(Self {
            engine,
            results,
            records,
            abort: None,
        })
    }

    /// Stop waiting for a record buffer once `abort` is requested.
    #[must_use]
    pub fn with_abort(mut self, abort: StopSignal) -> Self {
        self.abort = Some(abort);
        self
    }
}

impl<T: Sample> Transform for ProcessingStage<T> {
    type Input = FrameToken<T>;
    type Output = FrameToken<f32>;

    fn transform(
        &mut self,
        input: Self::Input,
        emit: &mut dyn FnMut(Self::Output),
    ) -> AppResult<()> {
        let mut record = acquire_output(&self.records, self.abort.as_ref()).ok_or_else(|| {
            PipelineError::Stage("processing".to_string(), "result pool unavailable".to_string())
        })?;
        self.engine.process(&input.data, &mut record)?;
        let index = input.index;
        drop(input);

        self.results.commit_frame(index, &record);
        emit(Tagged::new(index, record));
        Ok(())
    }
}

/// Result writer: appends parameter records to a file as little-endian
/// `f32`. After a write failure the writer disables itself and drains.
pub struct ResultWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    bytes: Vec<u8>,
    records: u64,
}

impl ResultWriter {
    /// Open `path` for appending.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Result file opened");
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            bytes: Vec::new(),
            records: 0,
        })
    }
}

impl Transform for ResultWriter {
    type Input = FrameToken<f32>;
    type Output = ();

    fn transform(&mut self, input: Self::Input, _emit: &mut dyn FnMut(())) -> AppResult<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        self.bytes.clear();
        encode_samples(&input.data, &mut self.bytes);
        if let Err(err) = out.write_all(&self.bytes) {
            error!(
                path = %self.path.display(),
                error = %err,
                "Result file write failed; writer disabled"
            );
            self.out = None;
            return Err(err.into());
        }
        self.records += 1;
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(mut out) = self.out.take() {
            if let Err(err) = out.flush() {
                error!(path = %self.path.display(), error = %err, "Result file flush failed");
            }
        }
        debug!(path = %self.path.display(), records = self.records, "Result writer closed");
    }
}

/// Per-modality result file derived from the configured base path:
/// `results.bin` becomes `results_flim.bin` / `results_oct.bin`.
#[must_use]
pub fn result_path(base: &Path, modality: crate::frame::Modality) -> PathBuf {
    let stem = base
        .file_stem()
        .map_or_else(|| "results".to_string(), |s| s.to_string_lossy().into_owned());
    let name = match base.extension() {
        Some(ext) => format!("{stem}_{modality}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{modality}"),
    };
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Modality, RawLayout};

    fn geometry() -> FrameGeometry {
        FrameGeometry {
            alines_per_frame: 2,
            flim_samples_per_aline: 8,
            oct_samples_per_aline: 4,
            raw_layout: RawLayout::Interleaved,
        }
    }

    fn processing() -> ProcessingConfig {
        ProcessingConfig {
            flim_channels: 2,
            flim_baseline_samples: 1,
            sample_interval_ns: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_flim_engine_outputs() {
        let mut engine = FlimPulseEngine::new(&geometry(), &processing());
        let names = FrameEngine::<u16>::outputs(&engine);
        assert_eq!(names, vec!["intensity_ch1", "intensity_ch2", "lifetime_ch1", "lifetime_ch2"]);

        // Each 4-sample window: baseline 10, then a pulse
        let input: Vec<u16> = vec![
            10, 30, 20, 10, /* ch2 */ 10, 10, 10, 10, // A-line 0
            10, 50, 10, 10, /* ch2 */ 10, 20, 20, 10, // A-line 1
        ];
        let mut outputs = vec![0.0; 8];
        FrameEngine::<u16>::process(&mut engine, &input, &mut outputs).unwrap();

        // intensity_ch1 rows
        assert_eq!(&outputs[0..2], &[30.0, 40.0]);
        // intensity_ch2 rows
        assert_eq!(&outputs[2..4], &[0.0, 20.0]);
        // lifetime_ch1 A-line 0: (1 * 10) / 30 samples * 0.5 ns
        assert!((outputs[4] - 10.0 / 30.0 * 0.5).abs() < 1e-6);
        // flat channel has no lifetime
        assert_eq!(outputs[6], 0.0);
    }

    #[test]
    fn test_oct_engine_mean_and_peak() {
        let mut engine = OctProjectionEngine::new(&geometry());
        let mut outputs = vec![0.0; 4];
        FrameEngine::<u16>::process(&mut engine, &[1, 2, 3, 6, 4, 4, 4, 4], &mut outputs).unwrap();
        assert_eq!(outputs, vec![3.0, 4.0, 6.0, 4.0]);
        assert!(FrameEngine::<u16>::process(&mut engine, &[1, 2, 3], &mut outputs).is_err());
    }

    #[test]
    fn test_processing_stage_commits_and_forwards() {
        let geometry = geometry();
        let engine: Box<dyn FrameEngine<u16>> = Box::new(OctProjectionEngine::new(&geometry));
        let results = Arc::new(ResultMaps::new(&engine.outputs(), engine.rows(), 4));
        let records = BufferPool::<f32>::allocate("oct-results", engine.record_len(), 2).unwrap();
        let frames = BufferPool::<u16>::allocate("oct", geometry.oct_frame_len(), 1).unwrap();
        let mut stage =
            ProcessingStage::new(engine, Arc::clone(&results), records.clone()).unwrap();

        let mut frame = frames.acquire().unwrap();
        frame.copy_from_slice(&[2, 2, 2, 2, 0, 8, 0, 0]);
        let mut forwarded = Vec::new();
        stage
            .transform(Tagged::new(5, frame), &mut |record| forwarded.push(record))
            .unwrap();

        assert_eq!(frames.available(), 1);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].index, 5);
        assert_eq!(results.get("peak").unwrap().column(5), vec![2.0, 8.0]);
        assert_eq!(results.completion().completed(), 1);
        drop(forwarded);
        assert_eq!(records.available(), 2);
    }

    #[test]
    fn test_result_writer_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results_flim.bin");
        let pool = BufferPool::<f32>::allocate("records", 2, 1).unwrap();
        let mut writer = ResultWriter::create(&path).unwrap();

        for value in [1.0f32, 2.0] {
            let mut record = pool.acquire().unwrap();
            record.fill(value);
            writer.transform(Tagged::new(0, record), &mut |()| {}).unwrap();
        }
        writer.finish();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[8..12], &2.0f32.to_le_bytes());
    }

    #[test]
    fn test_result_path_per_modality() {
        let base = Path::new("data/results.bin");
        assert_eq!(result_path(base, Modality::Flim), Path::new("data/results_flim.bin"));
        assert_eq!(result_path(Path::new("out"), Modality::Oct), Path::new("out_oct"));
    }
}
