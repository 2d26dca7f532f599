//! Status reporting out of the pipeline.
//!
//! The pipeline carries no UI. Every failure or notable transition leaves it
//! as a human-readable [`StatusMessage`] with a [`Severity`] flag, delivered
//! to the [`StatusSink`] injected when the pipeline is built. Sinks are
//! called from stage threads and must not block.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity flag attached to every status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Normal progress (recording started, file saved).
    Info,
    /// Degraded but continuing (frame dropped, artifact missing).
    Warning,
    /// The session or stage that raised it was aborted.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One message/flag pair emitted by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    /// Severity flag.
    pub severity: Severity,
    /// Component that raised the message (stage or session name).
    pub source: String,
    /// Human-readable text.
    pub message: String,
    /// Wall-clock time the message was raised.
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    /// Build a message stamped with the current time.
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.source, self.message)
    }
}

/// Observer receiving pipeline status.
pub trait StatusSink: Send + Sync {
    /// Deliver one message. Must return promptly.
    fn report(&self, status: StatusMessage);

    /// Shorthand for an info message.
    fn info(&self, source: &str, message: String) {
        self.report(StatusMessage::new(Severity::Info, source, message));
    }

    /// Shorthand for a warning.
    fn warning(&self, source: &str, message: String) {
        self.report(StatusMessage::new(Severity::Warning, source, message));
    }

    /// Shorthand for an error.
    fn error(&self, source: &str, message: String) {
        self.report(StatusMessage::new(Severity::Error, source, message));
    }
}

/// Writes status messages to the `tracing` log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn report(&self, status: StatusMessage) {
        match status.severity {
            Severity::Info => info!(source = %status.source, "{}", status.message),
            Severity::Warning => warn!(source = %status.source, "{}", status.message),
            Severity::Error => error!(source = %status.source, "{}", status.message),
        }
    }
}

/// Forwards status messages over an unbounded tokio channel.
///
/// Sending never blocks a stage thread. Messages raised after the receiver
/// is dropped are logged instead.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn report(&self, status: StatusMessage) {
        if let Err(mpsc::error::SendError(status)) = self.tx.send(status) {
            TracingSink.report(status);
        }
    }
}

/// Keeps every message in memory. Useful for tests and post-run summaries.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<StatusMessage>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all messages received so far.
    #[must_use]
    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages.lock().clone()
    }

    /// Messages at exactly `severity`.
    #[must_use]
    pub fn with_severity(&self, severity: Severity) -> Vec<StatusMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.severity == severity)
            .cloned()
            .collect()
    }
}

impl StatusSink for MemorySink {
    fn report(&self, status: StatusMessage) {
        self.messages.lock().push(status);
    }
}
