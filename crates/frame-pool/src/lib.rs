//! Fixed-size frame buffer pools and blocking hand-off queues.
//!
//! This crate provides the two resource primitives every stage of the
//! FLIm/OCT acquisition pipeline is built from:
//!
//! - [`BufferPool<T>`]: N pre-allocated, zero-filled frame buffers handed out
//!   as owned [`PoolBuffer<T>`] tokens
//! - [`HandoffQueue<T>`]: a FIFO that moves exactly one owned item at a time
//!   from a producer stage to a consumer stage, with a sentinel for shutdown
//!
//! # Ownership Model
//!
//! A [`PoolBuffer<T>`] is the only handle to its memory. Moving it through a
//! queue moves ownership, so no two stages can ever reference the same buffer.
//! Dropping the token returns the memory to the free-list it came from, which
//! makes a double release impossible to express.
//!
//! ```text
//! 1. BufferPool::allocate() pre-allocates N zeroed buffers at startup
//! 2. Producer acquire()s a buffer and fills it
//! 3. push() moves the buffer into the HandoffQueue
//! 4. Consumer pop()s it, reads it, then drops it
//! 5. Drop returns the buffer to the pool's free-list
//! ```
//!
//! Pool exhaustion is not an error. A producer that cannot acquire a buffer
//! stalls until a downstream consumer releases one, which is how backpressure
//! reaches the head of the pipeline.
//!
//! # Example
//!
//! ```
//! use frame_pool::{BufferPool, HandoffQueue};
//!
//! let pool = BufferPool::<u16>::allocate("raw", 1024, 4).unwrap();
//! let queue = HandoffQueue::new("raw->deinterleave");
//!
//! let mut frame = pool.acquire().unwrap();
//! frame[0] = 42;
//! queue.push(frame).unwrap();
//! queue.close();
//!
//! let frame = queue.pop().unwrap();
//! assert_eq!(frame[0], 42);
//! drop(frame);
//!
//! assert!(queue.pop().is_none());
//! assert_eq!(pool.available(), 4);
//! ```

pub mod pool;
pub mod queue;

pub use pool::{BufferPool, PoolBuffer};
pub use queue::{HandoffQueue, Popped, QueueClosed};

use thiserror::Error;

/// Errors raised by [`BufferPool`] lifecycle operations.
///
/// Exhaustion is deliberately absent: an empty free-list is backpressure,
/// reported as `None` from [`BufferPool::acquire`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Zero buffers or zero elements per buffer were requested.
    #[error("pool '{pool}' requested with zero size ({buffer_count} buffers x {elements_per_buffer} elements)")]
    ZeroSized {
        /// Pool name.
        pool: String,
        /// Requested buffer count.
        buffer_count: usize,
        /// Requested elements per buffer.
        elements_per_buffer: usize,
    },

    /// The allocator could not provide the requested memory.
    #[error("pool '{pool}' could not allocate {bytes} bytes")]
    OutOfMemory {
        /// Pool name.
        pool: String,
        /// Bytes that failed to allocate.
        bytes: usize,
    },

    /// `deallocate` was called while buffers were still in flight or queued.
    #[error("pool '{pool}' still has {outstanding} buffers outstanding")]
    BuffersOutstanding {
        /// Pool name.
        pool: String,
        /// Buffers not yet returned.
        outstanding: usize,
    },
}
