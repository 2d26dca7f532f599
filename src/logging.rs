//! Subscriber setup for the `flim-oct-daq` binary.
//!
//! Stage threads log through `tracing` with structured fields (`stage`,
//! `frame`, `pool`, ...) inside a per-stage span. [`init`] installs one
//! `tracing-subscriber` fmt layer:
//! - pretty, compact, or JSON output ([`LogFormat`])
//! - `RUST_LOG` filtering through `EnvFilter`, falling back to
//!   `application.log_level`
//! - thread names, since every stage runs on its own named thread
//! - optional span close events, which log each stage's lifetime
//!
//! ```no_run
//! use flim_oct_daq::config::PipelineConfig;
//! use flim_oct_daq::logging::{self, LogSettings};
//!
//! # fn main() -> flim_oct_daq::AppResult<()> {
//! let config = PipelineConfig::load()?;
//! logging::init(LogSettings::from_config(&config)?)?;
//! tracing::info!("Pipeline starting");
//! # Ok(())
//! # }
//! ```

use crate::config::PipelineConfig;
use crate::error::{AppResult, PipelineError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Console log layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, colored.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(PipelineError::Configuration(format!(
                "unknown log format '{other}' (pretty, compact, json)"
            ))),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Level used when `RUST_LOG` is unset.
    pub level: Level,
    /// Output layout.
    pub format: LogFormat,
    /// Log a close event (with busy/idle time) for every stage span.
    pub stage_lifetimes: bool,
    /// Source file and line on every event.
    pub source_location: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            stage_lifetimes: false,
            source_location: false,
        }
    }
}

impl LogSettings {
    /// Settings at the configured `application.log_level`.
    ///
    /// # Errors
    ///
    /// `Configuration` when the level name is unknown.
    pub fn from_config(config: &PipelineConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_level(&config.application.log_level)?,
            ..Self::default()
        })
    }

    /// Set the output layout.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log stage span close events.
    #[must_use]
    pub fn with_stage_lifetimes(mut self, enabled: bool) -> Self {
        self.stage_lifetimes = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// A no-op when a subscriber is already installed (tests, embedding
/// applications).
///
/// # Errors
///
/// `Configuration` when the subscriber cannot be registered.
pub fn init(settings: LogSettings) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_ascii_lowercase()));
    let spans = if settings.stage_lifetimes {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(spans)
        .with_thread_names(true)
        .with_file(settings.source_location)
        .with_line_number(settings.source_location);
    let layer = match settings.format {
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| PipelineError::Configuration(format!("logging: {e}")))
}

/// Parse a level name (case-insensitive).
///
/// # Errors
///
/// `Configuration` for anything but trace, debug, info, warn, error.
pub fn parse_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        PipelineError::Configuration(format!(
            "unknown log level '{level}' (trace, debug, info, warn, error)"
        ))
    })
}
