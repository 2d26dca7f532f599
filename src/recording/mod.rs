//! Recording and saving sessions.
//!
//! ```text
//!            start_recording             stop_recording / ring full
//!   Idle ───────────────────▶ Recording ─────────────────────────▶ Pending
//!    ▲                                                               │
//!    │        save finished (ok or failed)          start_saving     │
//!    └──────────────────────────────── Saving ◀──────────────────────┘
//! ```
//!
//! While recording, the deinterleave stage copies every frame into the next
//! slot of a private ring (its own [`BufferPool`], never the live pools).
//! Capture happens before inter-frame pairing, so the saved file gets the
//! inter-frame correction applied to its write order instead, and the two
//! corrections never touch the same data twice.
//!
//! Saving moves the captured slots to a writer thread; the live pipeline
//! keeps running and later captures are ignored until the session returns
//! to `Idle`.

pub mod writer;

use crate::config::PipelineConfig;
use crate::error::{AppResult, PipelineError};
use crate::frame::{FrameGeometry, Sample};
use crate::status::StatusSink;
use frame_pool::{BufferPool, PoolBuffer};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
pub use writer::{write_frames, SaveReport};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderPhase {
    /// No session, or the last one was saved or discarded.
    Idle,
    /// Copying live frames into the ring.
    Recording,
    /// Recording stopped with captured frames waiting to be saved.
    Pending,
    /// Writer thread serializing the captured frames.
    Saving,
}

impl fmt::Display for RecorderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderPhase::Idle => "idle",
            RecorderPhase::Recording => "recording",
            RecorderPhase::Pending => "holding unsaved frames",
            RecorderPhase::Saving => "saving",
        };
        f.write_str(name)
    }
}

/// Fixed recorder parameters.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Frame dimensions; each ring slot holds one recorded frame.
    pub geometry: FrameGeometry,
    /// Ring capacity in frames.
    pub capacity: usize,
    /// Inter-frame offset applied to the save write order.
    pub inter_frame_offset: isize,
    /// Configuration snapshot written next to every recording.
    pub snapshot: String,
    /// Calibration/mask artifacts copied next to every recording.
    pub sidecar_files: Vec<PathBuf>,
}

impl RecorderSettings {
    /// Settings taken from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> AppResult<Self> {
        Ok(Self {
            geometry: config.frame,
            capacity: config.recording.writing_buffer_size,
            inter_frame_offset: config.sync.inter_frame_offset,
            snapshot: config.snapshot()?,
            sidecar_files: config.recording.sidecar_files.clone(),
        })
    }
}

struct Session<T> {
    phase: RecorderPhase,
    ring: Option<BufferPool<T>>,
    frames: Vec<PoolBuffer<T>>,
    is_saved: bool,
    last_destination: Option<PathBuf>,
}

struct Shared<T> {
    settings: RecorderSettings,
    session: Mutex<Session<T>>,
    status: Arc<dyn StatusSink>,
}

/// Recording/saving orchestrator, shared between the deinterleave stage
/// (capture) and the operator (start/stop/save).
pub struct Recorder<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.shared.session.lock();
        f.debug_struct("Recorder")
            .field("phase", &session.phase)
            .field("frames_captured", &session.frames.len())
            .field("capacity", &self.shared.settings.capacity)
            .finish()
    }
}

impl<T: Sample> Recorder<T> {
    /// Idle recorder; the ring is allocated when recording starts.
    pub fn new(settings: RecorderSettings, status: Arc<dyn StatusSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                session: Mutex::new(Session {
                    phase: RecorderPhase::Idle,
                    ring: None,
                    frames: Vec::new(),
                    is_saved: false,
                    last_destination: None,
                }),
                status,
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> RecorderPhase {
        self.shared.session.lock().phase
    }

    /// Frames captured by the current (or pending) session.
    #[must_use]
    pub fn frames_captured(&self) -> usize {
        self.shared.session.lock().frames.len()
    }

    /// Ring capacity in frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.settings.capacity
    }

    /// Whether the most recent session was saved successfully.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.shared.session.lock().is_saved
    }

    /// Destination of the most recent successful save.
    #[must_use]
    pub fn last_destination(&self) -> Option<PathBuf> {
        self.shared.session.lock().last_destination.clone()
    }

    /// Begin a new session.
    ///
    /// Allowed from `Idle` and `Pending`; unsaved pending frames are
    /// discarded with a warning.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidState`] while recording or saving;
    /// [`PipelineError::Pool`] if the ring cannot be allocated.
    pub fn start_recording(&self) -> AppResult<()> {
        let settings = &self.shared.settings;
        let mut session = self.shared.session.lock();
        match session.phase {
            RecorderPhase::Idle => {}
            RecorderPhase::Pending => {
                let discarded = session.frames.len();
                session.frames.clear();
                warn!(discarded, "Unsaved recording discarded");
                self.shared.status.warning(
                    "recorder",
                    format!("discarded {discarded} unsaved frames"),
                );
            }
            phase => {
                return Err(PipelineError::InvalidState {
                    operation: "start recording",
                    state: phase.to_string(),
                })
            }
        }

        if session.ring.is_none() {
            session.ring = Some(BufferPool::allocate(
                "recording",
                settings.geometry.recorded_frame_len(),
                settings.capacity,
            )?);
        }
        session.frames.reserve(settings.capacity);
        session.phase = RecorderPhase::Recording;
        session.is_saved = false;
        info!(capacity = settings.capacity, "Recording started");
        self.shared
            .status
            .info("recorder", format!("recording up to {} frames", settings.capacity));
        Ok(())
    }

    /// Copy one deinterleaved frame into the ring.
    ///
    /// Returns `false` when not recording. When the ring fills, the session
    /// stops itself and later frames are not recorded.
    pub fn capture(&self, flim: &[T], oct: &[T]) -> bool {
        let mut session = self.shared.session.lock();
        if session.phase != RecorderPhase::Recording {
            return false;
        }
        let Some(mut slot) = session.ring.as_ref().and_then(|ring| ring.acquire()) else {
            return false;
        };
        if flim.len() + oct.len() != slot.len() {
            warn!(
                expected = slot.len(),
                actual = flim.len() + oct.len(),
                "Frame not recorded: size mismatch"
            );
            return false;
        }
        slot[..flim.len()].copy_from_slice(flim);
        slot[flim.len()..].copy_from_slice(oct);
        session.frames.push(slot);

        if session.frames.len() >= self.shared.settings.capacity {
            session.phase = RecorderPhase::Pending;
            info!(frames = session.frames.len(), "Recording ring full; recording stopped");
            self.shared.status.info(
                "recorder",
                format!("recording buffer full after {} frames", session.frames.len()),
            );
        }
        true
    }

    /// Freeze the session; returns the frames captured.
    ///
    /// A session with no frames is discarded and the recorder returns to
    /// `Idle`. Stopping a session that already stopped itself is a no-op.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidState`] when idle or saving.
    pub fn stop_recording(&self) -> AppResult<usize> {
        let mut session = self.shared.session.lock();
        match session.phase {
            RecorderPhase::Recording => {}
            RecorderPhase::Pending => return Ok(session.frames.len()),
            phase => {
                return Err(PipelineError::InvalidState {
                    operation: "stop recording",
                    state: phase.to_string(),
                })
            }
        }

        let captured = session.frames.len();
        if captured == 0 {
            session.phase = RecorderPhase::Idle;
            session.ring = None;
            info!("Recording stopped with no frames; session discarded");
            self.shared
                .status
                .info("recorder", "no frames captured; nothing to save".to_string());
        } else {
            session.phase = RecorderPhase::Pending;
            info!(frames = captured, "Recording stopped");
        }
        Ok(captured)
    }

    /// Save the pending session to `destination` on a writer thread.
    ///
    /// # Errors
    ///
    /// Fails without changing the session when not pending, when
    /// `destination` already exists ([`PipelineError::DestinationExists`]),
    /// or when the temporary file cannot be created.
    pub fn start_saving(&self, destination: impl AsRef<Path>) -> AppResult<SaveHandle> {
        let destination = destination.as_ref().to_path_buf();
        let settings = &self.shared.settings;

        let job = {
            let mut session = self.shared.session.lock();
            if session.phase != RecorderPhase::Pending {
                return Err(PipelineError::InvalidState {
                    operation: "save",
                    state: session.phase.to_string(),
                });
            }
            let temp = writer::prepare(&destination).map_err(|err| {
                warn!(path = %destination.display(), error = %err, "Save refused");
                self.shared.status.report(crate::status::StatusMessage::new(
                    err.severity(),
                    "recorder",
                    format!("save refused: {err}"),
                ));
                err
            })?;
            session.phase = RecorderPhase::Saving;
            writer::SaveJob {
                frames: std::mem::take(&mut session.frames),
                flim_len: settings.geometry.flim_frame_len(),
                inter_frame_offset: settings.inter_frame_offset,
                destination: destination.clone(),
                temp,
                snapshot: settings.snapshot.clone(),
                sidecar_files: settings.sidecar_files.clone(),
            }
        };
        info!(path = %destination.display(), frames = job.frames.len(), "Saving recording");

        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name("recording-writer".to_string())
            .spawn(move || {
                let result = writer::run::<T, _>(job, shared.status.as_ref());
                let mut session = shared.session.lock();
                session.phase = RecorderPhase::Idle;
                session.ring = None;
                match &result {
                    Ok(report) => {
                        session.is_saved = true;
                        session.last_destination = Some(report.destination.clone());
                        shared.status.info(
                            "recorder",
                            format!(
                                "saved {} frames to {}",
                                report.frames_written,
                                report.destination.display()
                            ),
                        );
                    }
                    Err(err) => {
                        session.is_saved = false;
                        error!(error = %err, "Save failed");
                        shared.status.error("recorder", format!("save failed: {err}"));
                    }
                }
                result
            });

        let join = match join {
            Ok(join) => join,
            Err(err) => {
                // The job (and its frames) went down with the failed spawn
                let mut session = self.shared.session.lock();
                session.phase = RecorderPhase::Idle;
                session.ring = None;
                return Err(PipelineError::Stage(
                    "recording-writer".to_string(),
                    err.to_string(),
                ));
            }
        };
        debug!("Writer thread spawned");

        Ok(SaveHandle { destination, join })
    }
}

/// Running save.
#[derive(Debug)]
pub struct SaveHandle {
    destination: PathBuf,
    join: JoinHandle<AppResult<SaveReport>>,
}

impl SaveHandle {
    /// Target file.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Whether the writer thread has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the save to complete.
    pub fn wait(self) -> AppResult<SaveReport> {
        self.join.join().map_err(|_| {
            PipelineError::Stage("recording-writer".to_string(), "thread panicked".to_string())
        })?
    }
}
