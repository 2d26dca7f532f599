//! CLI entry point for the FLIm-OCT pipeline.
//!
//! Run the pipeline against the simulated digitizer, optionally recording
//! and saving a session:
//! ```bash
//! flim-oct-daq run --frames 200 --record 100 --save data/pullback.data
//! ```
//!
//! Replay a saved recording through the processing stages:
//! ```bash
//! flim-oct-daq replay data/pullback.data
//! ```
//!
//! Report the frame count of a recording:
//! ```bash
//! flim-oct-daq inspect data/pullback.data
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flim_oct_daq::acquisition::{FileFrameSource, FrameSource, RecordedExtent, SimulatedDigitizer};
use flim_oct_daq::config::{PipelineConfig, SyncConfig, DEFAULT_CONFIG_PATH};
use flim_oct_daq::logging::{self, LogFormat, LogSettings};
use flim_oct_daq::pipeline::RawSample;
use flim_oct_daq::recording::RecorderPhase;
use flim_oct_daq::status::{ChannelSink, StatusSink};
use flim_oct_daq::{Acquisition, Engines, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "flim-oct-daq")]
#[command(about = "FLIm-OCT real-time acquisition pipeline", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log when each stage thread ends, with its busy/idle time
    #[arg(long, global = true)]
    stage_lifetimes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the simulated digitizer
    Run {
        /// Stop after this many frames (default: until Ctrl-C)
        #[arg(long)]
        frames: Option<u64>,

        /// Record this many frames from the start of the run
        #[arg(long)]
        record: Option<usize>,

        /// Save the recording here when it completes
        #[arg(long, requires = "record")]
        save: Option<PathBuf>,
    },

    /// Replay a saved recording through the processing stages
    Replay {
        /// Recording to replay
        file: PathBuf,
    },

    /// Print the frame count of a saved recording
    Inspect {
        /// Recording to inspect
        file: PathBuf,
    },
}

/// Interval between diagnostics lines while running.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(
        LogSettings::from_config(&config)?
            .with_format(cli.log_format)
            .with_stage_lifetimes(cli.stage_lifetimes),
    )?;

    match cli.command {
        Commands::Run {
            frames,
            record,
            save,
        } => {
            if let Some(record) = record {
                config.recording.writing_buffer_size = record;
            }
            let mut source = SimulatedDigitizer::from_config(&config);
            if let Some(frames) = frames {
                source = source.with_frame_limit(frames);
            }
            run(config, Box::new(source), record.is_some(), save).await
        }
        Commands::Replay { file } => {
            // Recordings already carry both synchronization corrections
            config.frame = config.frame.as_concatenated();
            config.sync = SyncConfig::disabled();
            let source = FileFrameSource::<RawSample>::open(&file, &config.frame)
                .with_context(|| format!("opening {}", file.display()))?;
            println!("Replaying {} frames from {}", source.frame_count(), file.display());
            run(config, Box::new(source), false, None).await
        }
        Commands::Inspect { file } => {
            let extent = RecordedExtent::of_file::<RawSample>(&file, &config.frame)
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{}", file.display());
            println!(
                "  frame size:     {} bytes",
                config.frame.recorded_frame_bytes::<RawSample>()
            );
            println!("  frames:         {}", extent.frames);
            if extent.trailing_bytes > 0 {
                println!("  trailing bytes: {} (partial frame)", extent.trailing_bytes);
            }
            Ok(())
        }
    }
}

async fn run(
    config: PipelineConfig,
    source: Box<dyn FrameSource<RawSample>>,
    record: bool,
    save: Option<PathBuf>,
) -> Result<()> {
    let (sink, mut messages) = ChannelSink::new();
    let status: Arc<dyn StatusSink> = Arc::new(sink);
    let printer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            println!("{message}");
        }
    });

    let engines = Engines::from_config(&config);
    let pipeline = Pipeline::start(config, Acquisition::Pull(source), engines, status)?;
    if record {
        pipeline.recorder().start_recording()?;
    }

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let interrupted = loop {
        tokio::select! {
            _ = signal::ctrl_c() => break true,
            _ = ticker.tick() => {
                tracing::info!(diagnostics = %pipeline.diagnostics(), "Pipeline running");
                if pipeline.is_finished() || pipeline.recorder().phase() == RecorderPhase::Pending {
                    break false;
                }
            }
        }
    };
    if interrupted {
        println!("Interrupted; stopping pipeline");
    }

    let recorder = pipeline.recorder().clone();
    let report = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    for stage in &report.stages {
        println!(
            "{:<16} in {:>6}  out {:>6}  dropped {:>4}",
            stage.name, stage.frames_in, stage.frames_out, stage.frames_dropped
        );
    }

    if record && recorder.phase() == RecorderPhase::Recording {
        recorder.stop_recording()?;
    }
    if let Some(destination) = save {
        if recorder.phase() == RecorderPhase::Pending {
            let handle = recorder.start_saving(&destination)?;
            let saved = tokio::task::spawn_blocking(move || handle.wait()).await??;
            println!(
                "Saved {} frames ({} bytes) to {}",
                saved.frames_written,
                saved.bytes_written,
                saved.destination.display()
            );
        }
    }

    drop(recorder);
    printer.await?;
    if !report.failures.is_empty() {
        anyhow::bail!("stages failed: {}", report.failures.join(", "));
    }
    Ok(())
}
