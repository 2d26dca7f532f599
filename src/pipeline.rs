//! Pipeline orchestrator.
//!
//! ```text
//!  source / driver ──▶ [acquisition] ──raw──▶ [deinterleave] ──flim──▶ [flim-processing] ──▶ [flim-writer]
//!                                                 │      └────oct───▶ [oct-processing]  ──▶ [oct-writer]
//!                                                 └──▶ recorder ring ──▶ save (writer thread)
//! ```
//!
//! Every arrow between stages is a [`HandoffQueue`] carrying buffers from
//! the upstream stage's [`BufferPool`]. All pools are allocated in
//! [`Pipeline::start`] after validation and before any thread starts.

use crate::acquisition::{spawn_acquisition, CallbackProducer, FrameSource};
use crate::config::PipelineConfig;
use crate::deinterleave::Deinterleave;
use crate::error::AppResult;
use crate::frame::Modality;
use crate::processing::{
    result_path, FlimPulseEngine, FrameEngine, OctProjectionEngine, ProcessingStage, ResultWriter,
};
use crate::recording::{Recorder, RecorderSettings};
use crate::results::ResultMaps;
use crate::stage::{
    spawn_transform_linked, Discard, Emit, FrameToken, Split, StageHandle, StageReport,
    StopSignal, Transform,
};
use crate::status::StatusSink;
use frame_pool::{BufferPool, HandoffQueue};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// Raw sample type delivered by the digitizers.
pub type RawSample = u16;

/// How raw frames enter the pipeline.
pub enum Acquisition {
    /// A dedicated thread pulls from this source.
    Pull(Box<dyn FrameSource<RawSample>>),
    /// A driver pushes through the [`CallbackProducer`] returned by
    /// [`Pipeline::take_callback`].
    Callback,
}

impl fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acquisition::Pull(source) => write!(f, "Pull({})", source.describe()),
            Acquisition::Callback => f.write_str("Callback"),
        }
    }
}

/// Processing engines for both modalities.
pub struct Engines {
    /// FLIm engine.
    pub flim: Box<dyn FrameEngine<RawSample>>,
    /// OCT engine.
    pub oct: Box<dyn FrameEngine<RawSample>>,
}

impl Engines {
    /// Built-in engines configured from `config`.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            flim: Box::new(FlimPulseEngine::new(&config.frame, &config.processing)),
            oct: Box::new(OctProjectionEngine::new(&config.frame)),
        }
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Total buffers.
    pub size: usize,
    /// Buffers on the free-list.
    pub available: usize,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Queue name.
    pub name: String,
    /// Items waiting (best effort).
    pub depth: usize,
    /// Whether the sentinel was pushed.
    pub closed: bool,
}

/// Diagnostics for telemetry and logs; not for control decisions.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDiagnostics {
    /// Every pool.
    pub pools: Vec<PoolStatus>,
    /// Every queue.
    pub queues: Vec<QueueStatus>,
    /// Frames in the current recording session.
    pub frames_captured: usize,
}

impl fmt::Display for PipelineDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pool in &self.pools {
            write!(f, "{}={}/{} ", pool.name, pool.available, pool.size)?;
        }
        for queue in &self.queues {
            write!(f, "q:{}={} ", queue.name, queue.depth)?;
        }
        write!(f, "recorded={}", self.frames_captured)
    }
}

/// Per-stage counters after shutdown.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// One report per stage, in topological order.
    pub stages: Vec<StageReport>,
    /// Stages that did not exit cleanly.
    pub failures: Vec<String>,
    /// Pool occupancy once every stage has exited.
    pub pools: Vec<PoolStatus>,
}

impl PipelineReport {
    /// Report for stage `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

struct Pools {
    raw: BufferPool<RawSample>,
    flim: BufferPool<RawSample>,
    oct: BufferPool<RawSample>,
    flim_records: BufferPool<f32>,
    oct_records: BufferPool<f32>,
}

struct Queues {
    raw: HandoffQueue<FrameToken<RawSample>>,
    flim: HandoffQueue<FrameToken<RawSample>>,
    oct: HandoffQueue<FrameToken<RawSample>>,
    flim_records: Option<HandoffQueue<FrameToken<f32>>>,
    oct_records: Option<HandoffQueue<FrameToken<f32>>>,
}

/// A running pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    stop: StopSignal,
    /// Requested by a stage that panicked; releases stalled peers.
    abort: StopSignal,
    pools: Pools,
    queues: Queues,
    stages: Vec<StageHandle>,
    pull: bool,
    callback: Option<CallbackProducer<RawSample>>,
    recorder: Recorder<RawSample>,
    flim_results: Arc<ResultMaps>,
    oct_results: Arc<ResultMaps>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.iter().map(StageHandle::name).collect::<Vec<_>>())
            .field("recorder", &self.recorder)
            .finish()
    }
}

impl Pipeline {
    /// Validate `config`, allocate every pool, and start all stages.
    ///
    /// # Errors
    ///
    /// Configuration errors and allocation failures, before any thread
    /// starts; thread spawn failures afterwards (already started stages are
    /// shut down).
    pub fn start(
        config: PipelineConfig,
        acquisition: Acquisition,
        engines: Engines,
        status: Arc<dyn StatusSink>,
    ) -> AppResult<Self> {
        config.validate()?;
        let span = info_span!("pipeline_start");
        let _enter = span.enter();

        let geometry = config.frame;
        let pullback = config.processing.pullback_frames;
        let pools = Pools {
            raw: BufferPool::allocate("raw", geometry.raw_frame_len(), config.pools.raw_buffers)?,
            flim: BufferPool::allocate(
                "flim",
                geometry.flim_frame_len(),
                config.pools.flim_buffers,
            )?,
            oct: BufferPool::allocate("oct", geometry.oct_frame_len(), config.pools.oct_buffers)?,
            flim_records: BufferPool::allocate(
                "flim-results",
                engines.flim.record_len(),
                config.pools.result_buffers,
            )?,
            oct_records: BufferPool::allocate(
                "oct-results",
                engines.oct.record_len(),
                config.pools.result_buffers,
            )?,
        };
        let flim_results = Arc::new(ResultMaps::new(
            &engines.flim.outputs(),
            engines.flim.rows(),
            pullback,
        ));
        let oct_results = Arc::new(ResultMaps::new(
            &engines.oct.outputs(),
            engines.oct.rows(),
            pullback,
        ));
        let recorder = Recorder::new(RecorderSettings::from_config(&config)?, Arc::clone(&status));

        let writers = match &config.processing.result_file {
            Some(base) => Some((
                ResultWriter::create(result_path(base, Modality::Flim))?,
                ResultWriter::create(result_path(base, Modality::Oct))?,
            )),
            None => None,
        };
        let queues = Queues {
            raw: HandoffQueue::new("raw"),
            flim: HandoffQueue::new("flim"),
            oct: HandoffQueue::new("oct"),
            flim_records: writers.as_ref().map(|_| HandoffQueue::new("flim-results")),
            oct_records: writers.as_ref().map(|_| HandoffQueue::new("oct-results")),
        };

        let abort = StopSignal::new();
        let flim_stage = ProcessingStage::new(
            engines.flim,
            Arc::clone(&flim_results),
            pools.flim_records.clone(),
        )?
        .with_abort(abort.clone());
        let oct_stage = ProcessingStage::new(
            engines.oct,
            Arc::clone(&oct_results),
            pools.oct_records.clone(),
        )?
        .with_abort(abort.clone());
        let deinterleave = Deinterleave::new(
            geometry,
            config.sync.clone(),
            pools.flim.clone(),
            pools.oct.clone(),
        )
        .with_recorder(recorder.clone())
        .with_abort(abort.clone());

        let mut pipeline = Self {
            config,
            stop: StopSignal::new(),
            abort,
            pools,
            queues,
            stages: Vec::new(),
            pull: false,
            callback: None,
            recorder,
            flim_results,
            oct_results,
        };

        let spawned = pipeline.spawn_stages(
            acquisition,
            deinterleave,
            flim_stage,
            oct_stage,
            writers,
            &status,
        );
        if let Err(err) = spawned {
            warn!(error = %err, "Pipeline start failed; shutting down started stages");
            pipeline.close_queues();
            pipeline.shutdown();
            return Err(err);
        }

        info!(
            stages = pipeline.stages.len(),
            alines = geometry.alines_per_frame,
            raw_buffers = pipeline.pools.raw.size(),
            "Pipeline started"
        );
        Ok(pipeline)
    }

    fn spawn_stages(
        &mut self,
        acquisition: Acquisition,
        deinterleave: Deinterleave<RawSample>,
        flim_stage: ProcessingStage<RawSample>,
        oct_stage: ProcessingStage<RawSample>,
        writers: Option<(ResultWriter, ResultWriter)>,
        status: &Arc<dyn StatusSink>,
    ) -> AppResult<()> {
        // Downstream first, so every consumer exists before its producer
        if let Some((flim_writer, oct_writer)) = writers {
            if let Some(queue) = &self.queues.oct_records {
                self.spawn_linked("oct-writer", queue.clone(), oct_writer, Discard, status)?;
            }
            if let Some(queue) = &self.queues.flim_records {
                self.spawn_linked("flim-writer", queue.clone(), flim_writer, Discard, status)?;
            }
        }
        let (oct_in, oct_out) = (self.queues.oct.clone(), self.queues.oct_records.clone());
        self.spawn_linked("oct-processing", oct_in, oct_stage, oct_out, status)?;
        let (flim_in, flim_out) = (self.queues.flim.clone(), self.queues.flim_records.clone());
        self.spawn_linked("flim-processing", flim_in, flim_stage, flim_out, status)?;
        let split = Split {
            first: self.queues.flim.clone(),
            second: self.queues.oct.clone(),
        };
        let raw = self.queues.raw.clone();
        self.spawn_linked("deinterleave", raw, deinterleave, split, status)?;

        match acquisition {
            Acquisition::Pull(source) => {
                self.stages.push(spawn_acquisition(
                    "acquisition",
                    source,
                    self.pools.raw.clone(),
                    self.queues.raw.clone(),
                    self.stop.clone(),
                    Arc::clone(status),
                )?);
                self.pull = true;
            }
            Acquisition::Callback => {
                self.callback = Some(CallbackProducer::new(
                    self.pools.raw.clone(),
                    self.queues.raw.clone(),
                    Arc::clone(status),
                ));
            }
        }

        // Join order is producer first
        self.stages.reverse();
        Ok(())
    }

    /// Spawn a transform stage sharing the pipeline's abort signal.
    fn spawn_linked<X, E>(
        &mut self,
        name: &str,
        input: HandoffQueue<X::Input>,
        transform: X,
        output: E,
        status: &Arc<dyn StatusSink>,
    ) -> AppResult<()>
    where
        X: Transform,
        E: Emit<X::Output>,
    {
        let stage = spawn_transform_linked(
            name,
            input,
            transform,
            output,
            Arc::clone(status),
            self.abort.clone(),
        )?;
        self.stages.push(stage);
        Ok(())
    }

    /// Configuration the pipeline runs with.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Recording/saving orchestrator.
    #[must_use]
    pub fn recorder(&self) -> &Recorder<RawSample> {
        &self.recorder
    }

    /// FLIm result maps.
    #[must_use]
    pub fn flim_results(&self) -> &Arc<ResultMaps> {
        &self.flim_results
    }

    /// OCT result maps.
    #[must_use]
    pub fn oct_results(&self) -> &Arc<ResultMaps> {
        &self.oct_results
    }

    /// Producer for callback acquisition; `None` in pull mode or once taken.
    pub fn take_callback(&mut self) -> Option<CallbackProducer<RawSample>> {
        self.callback.take()
    }

    /// Pool availability and queue depths.
    #[must_use]
    pub fn diagnostics(&self) -> PipelineDiagnostics {
        let pool = |p: &dyn PoolView| PoolStatus {
            name: p.name().to_string(),
            size: p.size(),
            available: p.available(),
        };
        let mut queues = vec![
            queue_status(&self.queues.raw),
            queue_status(&self.queues.flim),
            queue_status(&self.queues.oct),
        ];
        queues.extend(self.queues.flim_records.as_ref().map(queue_status));
        queues.extend(self.queues.oct_records.as_ref().map(queue_status));

        PipelineDiagnostics {
            pools: vec![
                pool(&self.pools.raw),
                pool(&self.pools.flim),
                pool(&self.pools.oct),
                pool(&self.pools.flim_records),
                pool(&self.pools.oct_records),
            ],
            queues,
            frames_captured: self.recorder.frames_captured(),
        }
    }

    /// Whether every stage has exited (source ended or stopped).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stages.iter().all(StageHandle::is_finished)
    }

    /// Request a stop and shut down in topological order.
    ///
    /// Acquisition finishes its current frame, then the sentinel cascades
    /// through every queue; frames already in flight are processed.
    pub fn stop(mut self) -> PipelineReport {
        info!("Pipeline stop requested");
        self.stop.request();
        self.shutdown()
    }

    /// Wait for the source to end on its own, then shut down.
    ///
    /// In callback mode the producer must be finished (or dropped) first.
    pub fn wait(mut self) -> PipelineReport {
        self.shutdown()
    }

    /// Push the sentinel into every queue so any started stage can exit.
    fn close_queues(&self) {
        self.queues.raw.close();
        self.queues.flim.close();
        self.queues.oct.close();
        if let Some(queue) = &self.queues.flim_records {
            queue.close();
        }
        if let Some(queue) = &self.queues.oct_records {
            queue.close();
        }
    }

    fn shutdown(&mut self) -> PipelineReport {
        if !self.pull {
            // Callback mode: no acquisition thread to push the sentinel
            if let Some(mut producer) = self.callback.take() {
                producer.finish();
            }
            if self.stop.is_requested() && !self.queues.raw.is_draining() {
                self.queues.raw.close();
            }
        }

        let mut report = PipelineReport::default();
        for stage in self.stages.drain(..) {
            let name = stage.name().to_string();
            match stage.join() {
                Ok(stage_report) => report.stages.push(stage_report),
                Err(err) => {
                    warn!(stage = %name, error = %err, "Stage did not exit cleanly");
                    report.failures.push(name);
                }
            }
        }
        if !report.stages.is_empty() {
            let diagnostics = self.diagnostics();
            info!(diagnostics = %diagnostics, "Pipeline stopped");
            report.pools = diagnostics.pools;
        }
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.stages.is_empty() {
            self.stop.request();
            self.shutdown();
        }
    }
}

/// Uniform view over pools of different sample types.
trait PoolView {
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn available(&self) -> usize;
}

impl<T: Copy + Default + Send + 'static> PoolView for BufferPool<T> {
    fn name(&self) -> &str {
        BufferPool::name(self)
    }

    fn size(&self) -> usize {
        BufferPool::size(self)
    }

    fn available(&self) -> usize {
        BufferPool::available(self)
    }
}

fn queue_status<T>(queue: &HandoffQueue<T>) -> QueueStatus {
    QueueStatus {
        name: queue.name().to_string(),
        depth: queue.len(),
        closed: queue.is_closed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::VecSource;
    use crate::error::PipelineError;
    use crate::status::MemorySink;

    fn small_config() -> PipelineConfig {
        PipelineConfig::from_toml_str(
            r#"
            [frame]
            alines_per_frame = 4
            flim_samples_per_aline = 4
            oct_samples_per_aline = 2

            [pools]
            raw_buffers = 2
            flim_buffers = 3
            oct_buffers = 3
            result_buffers = 2

            [processing]
            flim_channels = 2
            flim_baseline_samples = 1
            pullback_frames = 8

            [recording]
            writing_buffer_size = 4
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_starts_nothing() {
        let mut config = small_config();
        config.sync.flim_intra_offset = 4;
        let engines = Engines::from_config(&config);
        let result = Pipeline::start(
            config,
            Acquisition::Callback,
            engines,
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_pull_pipeline_drains_and_returns_buffers() {
        let config = small_config();
        let len = config.frame.raw_frame_len();
        let frames = (0..6u16).map(|k| vec![k; len]);
        let engines = Engines::from_config(&config);
        let pipeline = Pipeline::start(
            config,
            Acquisition::Pull(Box::new(VecSource::new(frames))),
            engines,
            Arc::new(MemorySink::new()),
        )
        .unwrap();

        assert!(pipeline
            .flim_results()
            .completion()
            .wait_for(6, std::time::Duration::from_secs(10)));
        let flim_results = Arc::clone(pipeline.flim_results());
        let report = pipeline.wait();

        assert!(report.failures.is_empty());
        assert_eq!(report.stage("acquisition").unwrap().frames_out, 6);
        assert_eq!(report.stage("deinterleave").unwrap().frames_out, 6);
        assert_eq!(report.stage("oct-processing").unwrap().frames_out, 6);
        assert_eq!(flim_results.completion().completed(), 6);

        assert_eq!(report.pools.len(), 5);
        for pool in &report.pools {
            assert_eq!(pool.available, pool.size, "pool {} not returned", pool.name);
        }
    }
}
