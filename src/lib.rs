//! # FLIm-OCT acquisition pipeline
//!
//! Real-time acquisition, processing, and recording for a dual-modality
//! (fluorescence-lifetime + OCT) rotating-catheter imaging system. Raw
//! frames move through fixed-size buffer pools and blocking hand-off queues:
//!
//! ```text
//! acquisition ─▶ deinterleave ─┬─▶ FLIm processing ─▶ result maps / result file
//!                              ├─▶ OCT processing  ─▶ result maps / result file
//!                              └─▶ recorder ring   ─▶ saved recording
//! ```
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based configuration (TOML + `FLIM_OCT_` environment) and validation.
//! - **`error`**: the `PipelineError` enum and `AppResult` alias.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`status`**: the `StatusSink` observer receiving severity-tagged messages.
//! - **`frame`**: sample types, frame geometry, raw layouts.
//! - **`sync`**: intra-frame rotation and inter-frame pairing.
//! - **`stage`**: the thread-per-stage driver and sentinel shutdown.
//! - **`acquisition`**: pull sources and the hardware callback producer.
//! - **`deinterleave`**: raw frame to per-modality sub-frames.
//! - **`processing`**, **`results`**: per-frame engines and the result maps they fill.
//! - **`recording`**: record/save sessions.
//! - **`pipeline`**: wires everything together.
//!
//! Buffer pools and queues live in the `frame_pool` crate.

pub mod acquisition;
pub mod config;
pub mod deinterleave;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod processing;
pub mod recording;
pub mod results;
pub mod stage;
pub mod status;
pub mod sync;

pub use error::{AppResult, PipelineError};
pub use frame_pool::{BufferPool, HandoffQueue, PoolBuffer, PoolError};
pub use pipeline::{Acquisition, Engines, Pipeline, PipelineReport};
