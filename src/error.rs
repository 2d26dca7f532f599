//! Custom error types for the pipeline.
//!
//! `PipelineError` consolidates everything that can go wrong between
//! configuration loading and the last byte of a saved recording. Using the
//! `thiserror` crate it converts from the underlying error types so that `?`
//! works across module boundaries.
//!
//! ## Error Categories
//!
//! - **Configuration** - `Config`, `Configuration`, `Pool` (zero-sized or
//!   unallocatable pools). Rejected before any stage thread starts; recover
//!   by fixing the configuration.
//! - **I/O** - `Io`, `Source`, `DestinationExists`, `FrameSize`. Fatal to the
//!   acquisition or recording session that raised them, never to the live
//!   pipeline as a whole.
//! - **Runtime** - `InvalidState`, `Processing`. Usually a caller ordering
//!   mistake or a single bad frame.
//!
//! Pool exhaustion is missing on purpose: it is backpressure, not an error.

use crate::status::Severity;
use frame_pool::PoolError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, PipelineError>;

/// Primary error type for the acquisition pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Buffer pool could not be created or torn down.
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// File system or device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame source failed to deliver a frame.
    #[error("Frame source error: {0}")]
    Source(String),

    /// A frame arrived with the wrong size.
    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize {
        /// Bytes required by the configured geometry.
        expected: usize,
        /// Bytes actually delivered.
        actual: usize,
    },

    /// Saving would overwrite an existing file.
    #[error("Destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// Operation not valid in the current session state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Current state.
        state: String,
    },

    /// A processing engine rejected a frame.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A stage thread could not be spawned or panicked.
    #[error("Stage '{0}' failed: {1}")]
    Stage(String, String),

    /// Configuration snapshot could not be serialized.
    #[error("Snapshot serialization error: {0}")]
    Snapshot(#[from] toml::ser::Error),
}

impl From<figment::Error> for PipelineError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl PipelineError {
    /// Severity attached when this error is reported through a status sink.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Processing(_) | Self::FrameSize { .. } | Self::InvalidState { .. } => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }

    /// Whether retrying (with different input or after reconfiguration) can
    /// succeed without restarting the process.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Pool(PoolError::OutOfMemory { .. }) | Self::Stage(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            PipelineError::Processing("bad pulse".into()).severity(),
            Severity::Warning
        );
        assert_eq!(
            PipelineError::DestinationExists(PathBuf::from("a.data")).severity(),
            Severity::Error
        );
    }

    #[test]
    fn test_out_of_memory_is_fatal() {
        let err = PipelineError::from(PoolError::OutOfMemory {
            pool: "raw".into(),
            bytes: 1 << 40,
        });
        assert!(!err.is_recoverable());
        assert!(PipelineError::Configuration("offset".into()).is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = PipelineError::InvalidState {
            operation: "start saving",
            state: "recording".into(),
        };
        assert_eq!(err.to_string(), "Cannot start saving while recording");

        let err = PipelineError::FrameSize {
            expected: 8,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Frame size mismatch: expected 8 bytes, got 4"
        );
    }
}
