//! Pipeline stage driver.
//!
//! Every stage is one named OS thread. Transform stages run the same loop:
//!
//! ```text
//! loop {
//!     pop input            (blocks; sentinel ends the loop)
//!     acquire output       (stalls on backpressure)
//!     transform            (output fully written before it leaves the stage)
//!     emit output          (push onto the next queue)
//!     drop input           (buffer returns to the upstream pool)
//! }
//! finish, then push the sentinel downstream
//! ```
//!
//! The sentinel is the only shutdown signal a transform stage observes, so
//! stages stop in topological order and nothing blocks forever on an empty
//! queue. Pull stages (acquisition) have no input queue; they check a
//! [`StopSignal`] at iteration boundaries instead and start the sentinel
//! cascade themselves.

use crate::error::{AppResult, PipelineError};
use crate::frame::Tagged;
use crate::status::{StatusMessage, StatusSink};
use frame_pool::{BufferPool, HandoffQueue, PoolBuffer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Interval between stop checks while stalled on an exhausted pool.
pub const STALL_POLL: Duration = Duration::from_millis(50);

/// Stalls longer than this are logged as warnings.
const STALL_WARN: Duration = Duration::from_secs(1);

/// A pool buffer in flight between stages, tagged with its frame index.
pub type FrameToken<T> = Tagged<PoolBuffer<T>>;

/// One transform step of a stage.
pub trait Transform: Send + 'static {
    /// Item popped from the input queue.
    type Input: Send + 'static;
    /// Item handed to the stage output.
    type Output: Send + 'static;

    /// Consume one input, emitting zero or more outputs.
    ///
    /// An error drops this frame only; the stage keeps running.
    fn transform(
        &mut self,
        input: Self::Input,
        emit: &mut dyn FnMut(Self::Output),
    ) -> AppResult<()>;

    /// Called once after the input sentinel, before the sentinel is
    /// propagated. Release anything still held here.
    fn finish(&mut self) {}
}

/// Destination of a stage's outputs.
pub trait Emit<T>: Send + 'static {
    /// Hand over one output.
    fn emit(&mut self, item: T);
    /// Propagate the shutdown sentinel.
    fn close(&mut self);
}

impl<T: Send + 'static> Emit<T> for HandoffQueue<T> {
    fn emit(&mut self, item: T) {
        if let Err(closed) = self.push(item) {
            // Only reachable if someone closed our output early; the item is dropped
            warn!(queue = %closed.queue, "Output closed before stage finished; dropping frame");
        }
    }

    fn close(&mut self) {
        HandoffQueue::close(self);
    }
}

/// Optional output: `None` drops every item.
impl<T: Send + 'static, E: Emit<T>> Emit<T> for Option<E> {
    fn emit(&mut self, item: T) {
        if let Some(inner) = self {
            inner.emit(item);
        }
    }

    fn close(&mut self) {
        if let Some(inner) = self {
            inner.close();
        }
    }
}

/// Drops every output; dropped buffers return to their pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl<T: Send + 'static> Emit<T> for Discard {
    fn emit(&mut self, _item: T) {}

    fn close(&mut self) {}
}

/// Routes the halves of a pair to two queues.
#[derive(Debug)]
pub struct Split<A, B> {
    /// Receives the first element.
    pub first: HandoffQueue<A>,
    /// Receives the second element.
    pub second: HandoffQueue<B>,
}

impl<A: Send + 'static, B: Send + 'static> Emit<(A, B)> for Split<A, B> {
    fn emit(&mut self, (a, b): (A, B)) {
        self.first.emit(a);
        self.second.emit(b);
    }

    fn close(&mut self) {
        HandoffQueue::close(&self.first);
        HandoffQueue::close(&self.second);
    }
}

/// Explicit stop request for pull stages.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Fresh, un-requested signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the stage to stop after its current frame.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Take an output buffer, stalling while the pool is exhausted.
///
/// Exhaustion is backpressure: the stage waits for a downstream consumer to
/// release a buffer and never allocates. Returns `None` only if `stop` is
/// requested during the stall.
pub fn acquire_output<T>(pool: &BufferPool<T>, stop: Option<&StopSignal>) -> Option<PoolBuffer<T>>
where
    T: Copy + Default + Send + 'static,
{
    if let Some(buffer) = pool.acquire() {
        return Some(buffer);
    }

    trace!(pool = pool.name(), "Output pool exhausted; stalling");
    let started = Instant::now();
    let mut warned = false;
    loop {
        if let Some(buffer) = pool.acquire_timeout(STALL_POLL) {
            debug!(
                pool = pool.name(),
                stalled_ms = started.elapsed().as_millis() as u64,
                "Backpressure stall resolved"
            );
            return Some(buffer);
        }
        if stop.is_some_and(StopSignal::is_requested) {
            return None;
        }
        if !warned && started.elapsed() > STALL_WARN {
            warn!(
                pool = pool.name(),
                size = pool.size(),
                "Backpressure: no free buffer for over a second"
            );
            warned = true;
        }
    }
}

/// Pushes the sentinel into a queue when dropped, unless it already was.
///
/// Held by stages without a transform loop so a panic still ends the
/// stream downstream.
#[derive(Debug)]
pub struct SentinelGuard<T>(HandoffQueue<T>);

impl<T> SentinelGuard<T> {
    /// Guard `queue`.
    #[must_use]
    pub fn new(queue: HandoffQueue<T>) -> Self {
        Self(queue)
    }
}

impl<T> Drop for SentinelGuard<T> {
    fn drop(&mut self) {
        if !self.0.is_draining() {
            self.0.close();
        }
    }
}

/// Frame counters returned when a stage exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Stage (thread) name.
    pub name: String,
    /// Items taken from the input (or source).
    pub frames_in: u64,
    /// Items handed downstream.
    pub frames_out: u64,
    /// Items dropped because of a per-frame failure.
    pub frames_dropped: u64,
}

impl StageReport {
    /// Zeroed report for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Running stage thread.
#[derive(Debug)]
pub struct StageHandle {
    name: String,
    join: JoinHandle<StageReport>,
}

impl StageHandle {
    /// Spawn `body` on a named thread.
    pub fn spawn<F>(name: &str, body: F) -> AppResult<Self>
    where
        F: FnOnce() -> StageReport + Send + 'static,
    {
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| PipelineError::Stage(name.to_string(), e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            join,
        })
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the stage to exit.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Stage`] if the thread panicked.
    pub fn join(self) -> AppResult<StageReport> {
        self.join
            .join()
            .map_err(|_| PipelineError::Stage(self.name, "thread panicked".to_string()))
    }
}

/// Spawn a transform stage.
///
/// The stage pops `input` until the sentinel, runs `transform` on every
/// item, and hands outputs to `output`. Per-frame errors are logged and
/// reported to `status` with their severity; the frame is dropped and the
/// loop continues.
///
/// A panic inside `transform` ends the stage; see [`spawn_transform_linked`].
pub fn spawn_transform<X, E>(
    name: &str,
    input: HandoffQueue<X::Input>,
    transform: X,
    output: E,
    status: Arc<dyn StatusSink>,
) -> AppResult<StageHandle>
where
    X: Transform,
    E: Emit<X::Output>,
{
    spawn_transform_linked(name, input, transform, output, status, StopSignal::new())
}

/// Spawn a transform stage that requests `abort` if it panics.
///
/// After a panic the transform is dropped (releasing anything it held), an
/// Error status is reported, `abort` is requested, the input is drained to
/// its sentinel so upstream buffers keep returning, and the sentinel is
/// pushed downstream. [`StageHandle::join`] then reports the panic.
pub fn spawn_transform_linked<X, E>(
    name: &str,
    input: HandoffQueue<X::Input>,
    transform: X,
    mut output: E,
    status: Arc<dyn StatusSink>,
    abort: StopSignal,
) -> AppResult<StageHandle>
where
    X: Transform,
    E: Emit<X::Output>,
{
    let stage = name.to_string();
    StageHandle::spawn(name, move || {
        let span = info_span!("stage", stage = %stage);
        let _enter = span.enter();
        let mut report = StageReport::new(&stage);
        let mut transform = Some(transform);

        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            let Some(transform) = transform.as_mut() else {
                return;
            };
            while let Some(item) = input.pop() {
                report.frames_in += 1;
                let mut emitted = 0u64;
                let result = transform.transform(item, &mut |out| {
                    output.emit(out);
                    emitted += 1;
                });
                report.frames_out += emitted;

                if let Err(err) = result {
                    report.frames_dropped += 1;
                    warn!(error = %err, frame = report.frames_in - 1, "Frame dropped");
                    status.report(StatusMessage::new(
                        err.severity(),
                        &stage,
                        format!("frame {} dropped: {err}", report.frames_in - 1),
                    ));
                }
            }
            transform.finish();
        }));

        if let Err(payload) = run {
            drop(transform.take());
            let frame = report.frames_in.saturating_sub(1);
            error!(frame, "Stage panicked; draining input");
            status.error(&stage, format!("stage panicked at frame {frame}"));
            abort.request();
            while input.pop().is_some() {
                report.frames_dropped += 1;
            }
            output.close();
            panic::resume_unwind(payload);
        }

        output.close();
        info!(
            frames_in = report.frames_in,
            frames_out = report.frames_out,
            frames_dropped = report.frames_dropped,
            "Stage finished"
        );
        report
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemorySink, Severity};

    /// Doubles every value; fails on 13.
    struct Doubler {
        finished: Arc<AtomicBool>,
    }

    impl Transform for Doubler {
        type Input = u32;
        type Output = u32;

        fn transform(&mut self, input: u32, emit: &mut dyn FnMut(u32)) -> AppResult<()> {
            if input == 13 {
                return Err(PipelineError::Processing("unlucky".into()));
            }
            emit(input * 2);
            Ok(())
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_transform_stage_propagates_sentinel() {
        let input = HandoffQueue::new("in");
        let output = HandoffQueue::new("out");
        let finished = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(MemorySink::new());

        let handle = spawn_transform(
            "doubler",
            input.clone(),
            Doubler {
                finished: Arc::clone(&finished),
            },
            output.clone(),
            sink.clone(),
        )
        .unwrap();

        for i in [1, 13, 2, 3] {
            input.push(i).unwrap();
        }
        input.close();

        let mut seen = Vec::new();
        while let Some(v) = output.pop() {
            seen.push(v);
        }
        assert_eq!(seen, vec![2, 4, 6]);

        let report = handle.join().unwrap();
        assert_eq!(report.frames_in, 4);
        assert_eq!(report.frames_out, 3);
        assert_eq!(report.frames_dropped, 1);
        assert!(finished.load(Ordering::SeqCst));

        let warnings = sink.with_severity(Severity::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("frame 1 dropped"));
    }

    #[test]
    fn test_split_closes_both_outputs() {
        let mut split = Split {
            first: HandoffQueue::new("a"),
            second: HandoffQueue::new("b"),
        };
        split.emit((1u8, "one"));
        Emit::<(u8, &str)>::close(&mut split);
        assert_eq!(split.first.pop(), Some(1));
        assert_eq!(split.first.pop(), None);
        assert_eq!(split.second.pop(), Some("one"));
        assert_eq!(split.second.pop(), None);
    }

    #[test]
    fn test_acquire_output_gives_up_on_stop() {
        let pool = BufferPool::<u8>::allocate("stall", 4, 1).unwrap();
        let _held = pool.acquire().unwrap();
        let stop = StopSignal::new();
        stop.request();
        assert!(acquire_output(&pool, Some(&stop)).is_none());
    }

    #[test]
    fn test_acquire_output_waits_for_release() {
        let pool = BufferPool::<u8>::allocate("stall", 4, 1).unwrap();
        let held = pool.acquire().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            drop(held);
        });
        assert!(acquire_output(&pool, None).is_some());
        releaser.join().unwrap();
    }

    /// Forwards the first byte of each buffer; panics on 2.
    struct Fragile;

    impl Transform for Fragile {
        type Input = PoolBuffer<u8>;
        type Output = u8;

        fn transform(
            &mut self,
            input: PoolBuffer<u8>,
            emit: &mut dyn FnMut(u8),
        ) -> AppResult<()> {
            assert_ne!(input[0], 2, "engine bug");
            emit(input[0]);
            Ok(())
        }
    }

    #[test]
    fn test_panicking_stage_drains_input_and_closes_output() {
        let pool = BufferPool::<u8>::allocate("in", 1, 4).unwrap();
        let input = HandoffQueue::new("in");
        let output = HandoffQueue::new("out");
        let abort = StopSignal::new();
        let sink = Arc::new(MemorySink::new());

        let handle = spawn_transform_linked(
            "fragile",
            input.clone(),
            Fragile,
            output.clone(),
            sink.clone(),
            abort.clone(),
        )
        .unwrap();

        for value in 0..4u8 {
            let mut buffer = pool.acquire().unwrap();
            buffer[0] = value;
            input.push(buffer).unwrap();
        }
        input.close();

        let mut seen = Vec::new();
        while let Some(v) = output.pop() {
            seen.push(v);
        }
        assert_eq!(seen, vec![0, 1]);
        assert!(matches!(handle.join(), Err(PipelineError::Stage(..))));
        assert!(abort.is_requested());
        assert_eq!(pool.available(), 4);
        assert_eq!(sink.with_severity(Severity::Error).len(), 1);
    }

    #[test]
    fn test_sentinel_guard_closes_once() {
        let queue: HandoffQueue<u8> = HandoffQueue::new("guarded");
        drop(SentinelGuard::new(queue.clone()));
        assert!(queue.is_draining());

        let closed = HandoffQueue::<u8>::new("closed");
        closed.close();
        drop(SentinelGuard::new(closed.clone()));
        assert_eq!(closed.pop(), None);
    }
}
