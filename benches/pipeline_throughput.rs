//! Throughput of the full pipeline (acquisition through both processing
//! stages) for a small frame geometry.
//!
//! Run with: `cargo bench --bench pipeline_throughput`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flim_oct_daq::acquisition::SimulatedDigitizer;
use flim_oct_daq::config::PipelineConfig;
use flim_oct_daq::status::MemorySink;
use flim_oct_daq::{Acquisition, Engines, Pipeline};
use std::hint::black_box;
use std::sync::Arc;

fn bench_config(alines: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.frame.alines_per_frame = alines;
    config.frame.flim_samples_per_aline = 32;
    config.frame.oct_samples_per_aline = 256;
    config.processing.pullback_frames = 64;
    config.sync.inter_frame_offset = 2;
    config
}

fn bench_pipeline(c: &mut Criterion) {
    const FRAMES: u64 = 64;
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(FRAMES));
    group.sample_size(10);

    for alines in [64usize, 256] {
        let config = bench_config(alines);
        group.bench_with_input(BenchmarkId::new("frames", alines), &config, |b, config| {
            b.iter(|| {
                let source = SimulatedDigitizer::from_config(config).with_frame_limit(FRAMES);
                let pipeline = Pipeline::start(
                    config.clone(),
                    Acquisition::Pull(Box::new(source)),
                    Engines::from_config(config),
                    Arc::new(MemorySink::new()),
                )
                .unwrap();
                black_box(pipeline.wait())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
