//! Pipeline configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, default `config/pipeline.toml`)
//! 2. environment variables prefixed with `FLIM_OCT_`, nested keys separated
//!    by `__` (e.g. `FLIM_OCT_SYNC__INTER_FRAME_OFFSET=3`)
//!
//! Every value is fixed before the first pool is allocated and stays
//! immutable for the lifetime of the pipeline. [`PipelineConfig::validate`]
//! must pass before any stage thread starts.
//!
//! # Example
//! ```no_run
//! use flim_oct_daq::config::PipelineConfig;
//!
//! let config = PipelineConfig::load_from("config/pipeline.toml")?;
//! config.validate()?;
//! println!("A-lines per frame: {}", config.frame.alines_per_frame);
//! # Ok::<(), flim_oct_daq::PipelineError>(())
//! ```

use crate::error::{AppResult, PipelineError};
use crate::frame::{FrameGeometry, Modality};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Frame dimensions of both modalities.
    #[serde(default)]
    pub frame: FrameGeometry,
    /// Buffer counts per pool.
    #[serde(default)]
    pub pools: PoolConfig,
    /// Intra- and inter-frame synchronization offsets.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Recording ring and save destination.
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Processing engines and result maps.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Simulated digitizer settings.
    #[serde(default)]
    pub source: SourceConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "FLIm-OCT DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Buffer counts for each fixed-size pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Raw combined frames (acquisition -> deinterleave).
    #[serde(default = "default_raw_buffers")]
    pub raw_buffers: usize,
    /// FLIm sub-frames (deinterleave -> FLIm processing).
    #[serde(default = "default_modality_buffers")]
    pub flim_buffers: usize,
    /// OCT sub-frames (deinterleave -> OCT processing).
    #[serde(default = "default_modality_buffers")]
    pub oct_buffers: usize,
    /// Per-frame parameter records (processing -> result writer).
    #[serde(default = "default_result_buffers")]
    pub result_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            raw_buffers: default_raw_buffers(),
            flim_buffers: default_modality_buffers(),
            oct_buffers: default_modality_buffers(),
            result_buffers: default_result_buffers(),
        }
    }
}

/// Synchronization offsets for one acquisition session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Circular A-line rotation applied to FLIm sub-frames.
    #[serde(default)]
    pub flim_intra_offset: usize,
    /// Circular A-line rotation applied to OCT sub-frames.
    #[serde(default)]
    pub oct_intra_offset: usize,
    /// Frames by which the OCT stream lags FLIm. Negative: FLIm lags OCT.
    #[serde(default)]
    pub inter_frame_offset: isize,
}

impl SyncConfig {
    /// Offsets that leave every frame untouched; used when replaying
    /// recordings that already carry both corrections.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Modality whose buffers are held back while the other catches up.
    #[must_use]
    pub fn leading_modality(&self) -> Option<Modality> {
        match self.inter_frame_offset {
            0 => None,
            n if n > 0 => Some(Modality::Flim),
            _ => Some(Modality::Oct),
        }
    }
}

/// Recording ring and save settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Maximum frames one recording session can capture.
    #[serde(default = "default_writing_buffer_size")]
    pub writing_buffer_size: usize,
    /// Default directory for saved recordings.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Calibration and mask artifacts copied next to every saved recording.
    #[serde(default)]
    pub sidecar_files: Vec<PathBuf>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            writing_buffer_size: default_writing_buffer_size(),
            output_dir: default_output_dir(),
            sidecar_files: Vec::new(),
        }
    }
}

/// Processing stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Columns in each result map (frames shown along the pullback).
    #[serde(default = "default_pullback_frames")]
    pub pullback_frames: usize,
    /// Emission channels packed into each FLIm A-line.
    #[serde(default = "default_flim_channels")]
    pub flim_channels: usize,
    /// Leading samples of each channel window used as the baseline.
    #[serde(default = "default_flim_baseline")]
    pub flim_baseline_samples: usize,
    /// Digitizer sampling interval in nanoseconds.
    #[serde(default = "default_sample_interval_ns")]
    pub sample_interval_ns: f32,
    /// Append per-frame parameter records to this file when set.
    #[serde(default)]
    pub result_file: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            pullback_frames: default_pullback_frames(),
            flim_channels: default_flim_channels(),
            flim_baseline_samples: default_flim_baseline(),
            sample_interval_ns: default_sample_interval_ns(),
            result_file: None,
        }
    }
}

/// Simulated digitizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Frame pacing; 0 produces frames as fast as the pipeline accepts them.
    #[serde(default)]
    pub frame_rate_hz: f64,
    /// Peak-to-peak noise added to every sample.
    #[serde(default = "default_noise")]
    pub noise_amplitude: u16,
    /// RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 0.0,
            noise_amplitude: default_noise(),
            seed: 0,
        }
    }
}

// Default value functions
fn default_raw_buffers() -> usize {
    8
}

fn default_modality_buffers() -> usize {
    16
}

fn default_result_buffers() -> usize {
    8
}

fn default_writing_buffer_size() -> usize {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_pullback_frames() -> usize {
    2000
}

fn default_flim_channels() -> usize {
    4
}

fn default_flim_baseline() -> usize {
    2
}

fn default_sample_interval_ns() -> f32 {
    0.4
}

fn default_noise() -> u16 {
    16
}

impl PipelineConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Missing keys fall back to defaults; environment variables override
    /// both.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLIM_OCT_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration before any pool is allocated.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] naming the first offending value.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(PipelineError::Configuration(msg));

        crate::logging::parse_level(&self.application.log_level)?;

        let frame = &self.frame;
        if frame.alines_per_frame == 0
            || frame.flim_samples_per_aline == 0
            || frame.oct_samples_per_aline == 0
        {
            return invalid(format!(
                "Frame dimensions must be non-zero (alines={}, flim={}, oct={})",
                frame.alines_per_frame, frame.flim_samples_per_aline, frame.oct_samples_per_aline
            ));
        }

        let pools = [
            ("raw_buffers", self.pools.raw_buffers),
            ("flim_buffers", self.pools.flim_buffers),
            ("oct_buffers", self.pools.oct_buffers),
            ("result_buffers", self.pools.result_buffers),
            ("writing_buffer_size", self.recording.writing_buffer_size),
            ("pullback_frames", self.processing.pullback_frames),
        ];
        for (name, count) in pools {
            if count == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }

        for (name, offset) in [
            ("flim_intra_offset", self.sync.flim_intra_offset),
            ("oct_intra_offset", self.sync.oct_intra_offset),
        ] {
            if offset >= frame.alines_per_frame {
                return invalid(format!(
                    "{name} {offset} must be smaller than alines_per_frame {}",
                    frame.alines_per_frame
                ));
            }
        }

        // The leading modality parks |offset| buffers in the delay line and
        // still needs one free buffer to make progress.
        let lag = self.sync.inter_frame_offset.unsigned_abs();
        if let Some(leading) = self.sync.leading_modality() {
            let pool_size = match leading {
                Modality::Flim => self.pools.flim_buffers,
                Modality::Oct => self.pools.oct_buffers,
            };
            if lag >= pool_size {
                return invalid(format!(
                    "inter_frame_offset {} needs more than {lag} {leading} buffers (have {pool_size})",
                    self.sync.inter_frame_offset
                ));
            }
        }

        let channels = self.processing.flim_channels;
        if channels == 0 || frame.flim_samples_per_aline % channels != 0 {
            return invalid(format!(
                "flim_samples_per_aline {} must split evenly into {channels} channels",
                frame.flim_samples_per_aline
            ));
        }
        if self.processing.flim_baseline_samples >= frame.flim_samples_per_aline / channels {
            return invalid(format!(
                "flim_baseline_samples {} leaves no signal in a {}-sample channel window",
                self.processing.flim_baseline_samples,
                frame.flim_samples_per_aline / channels
            ));
        }

        if self.source.frame_rate_hz < 0.0 || !self.source.frame_rate_hz.is_finite() {
            return invalid(format!(
                "frame_rate_hz {} must be a finite, non-negative number",
                self.source.frame_rate_hz
            ));
        }

        Ok(())
    }

    /// Serialize the configuration as TOML for the recording sidecar.
    pub fn snapshot(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
