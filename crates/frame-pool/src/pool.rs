//! Fixed-size pool of pre-allocated frame buffers.
//!
//! # Design
//!
//! The pool owns `buffer_count` zero-filled `Box<[T]>` blocks of identical
//! length. The free-list is a `Vec` behind a single `parking_lot::Mutex`
//! scoped to this pool; the mutex protects bookkeeping only and is never held
//! while a buffer's contents are read or written.
//!
//! Buffers leave the pool as [`PoolBuffer<T>`] tokens. The token is the sole
//! owner of its block until it is dropped (or passed to [`BufferPool::release`]),
//! at which point the block goes back on the free-list and one waiter in
//! [`BufferPool::acquire_timeout`] is woken.
//!
//! The pool never grows. When the free-list is empty the producer must stall;
//! allocating ad hoc would break the fixed memory budget of the acquisition
//! system.

use crate::PoolError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct PoolInner<T> {
    name: String,
    /// Free-list. Only pool bookkeeping happens under this lock.
    free: Mutex<Vec<Box<[T]>>>,
    /// Signalled once per returned buffer.
    returned: Condvar,
    elements_per_buffer: usize,
    pool_size: usize,
    /// Set by `deallocate`; buffers returned afterwards are freed instead.
    torn_down: AtomicBool,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl<T> PoolInner<T> {
    fn give_back(&self, data: Box<[T]>) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        self.free.lock().push(data);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
        self.returned.notify_one();
    }
}

/// Pool of pre-allocated, equally sized frame buffers.
///
/// Cloning the pool clones a handle; all clones share one free-list.
pub struct BufferPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn zeroed_buffer<T: Copy + Default>(len: usize) -> Option<Box<[T]>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).ok()?;
    buffer.resize(len, T::default());
    Some(buffer.into_boxed_slice())
}

impl<T: Copy + Default + Send + 'static> BufferPool<T> {
    /// Allocate `buffer_count` zero-filled buffers of `elements_per_buffer` elements.
    ///
    /// Must be called once per pool lifetime, before any stage thread starts.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ZeroSized`] if either dimension is zero
    /// - [`PoolError::OutOfMemory`] if the allocator refuses; the pipeline
    ///   cannot start in that case
    pub fn allocate(
        name: impl Into<String>,
        elements_per_buffer: usize,
        buffer_count: usize,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        if buffer_count == 0 || elements_per_buffer == 0 {
            return Err(PoolError::ZeroSized {
                pool: name,
                buffer_count,
                elements_per_buffer,
            });
        }

        let buffer_bytes = elements_per_buffer.saturating_mul(std::mem::size_of::<T>());
        let out_of_memory = |pool: &str| PoolError::OutOfMemory {
            pool: pool.to_string(),
            bytes: buffer_bytes.saturating_mul(buffer_count),
        };

        let mut free = Vec::new();
        free.try_reserve_exact(buffer_count)
            .map_err(|_| out_of_memory(&name))?;
        for _ in 0..buffer_count {
            let buffer = zeroed_buffer(elements_per_buffer).ok_or_else(|| out_of_memory(&name))?;
            free.push(buffer);
        }

        info!(
            pool = %name,
            buffer_count,
            elements_per_buffer,
            total_mb = (buffer_bytes * buffer_count) as f64 / (1024.0 * 1024.0),
            "BufferPool allocated"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                free: Mutex::new(free),
                returned: Condvar::new(),
                elements_per_buffer,
                pool_size: buffer_count,
                torn_down: AtomicBool::new(false),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        })
    }

    /// Take one buffer from the free-list without waiting.
    ///
    /// Returns `None` when every buffer is in flight or queued downstream.
    /// That is backpressure, not failure; the caller retries.
    #[must_use]
    pub fn acquire(&self) -> Option<PoolBuffer<T>> {
        let data = self.inner.free.lock().pop()?;
        Some(self.loan(data))
    }

    /// Take one buffer, stalling up to `timeout` for a downstream stage to
    /// release one.
    ///
    /// The wait parks on a condition variable, so a stalled producer does
    /// not spin.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PoolBuffer<T>> {
        let deadline = Instant::now() + timeout;
        let mut free = self.inner.free.lock();
        loop {
            if let Some(data) = free.pop() {
                drop(free);
                return Some(self.loan(data));
            }
            if self.inner.returned.wait_until(&mut free, deadline).timed_out() {
                let data = free.pop()?;
                drop(free);
                return Some(self.loan(data));
            }
        }
    }

    fn loan(&self, data: Box<[T]>) -> PoolBuffer<T> {
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        PoolBuffer {
            data: Some(data),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a buffer to its pool.
    ///
    /// Equivalent to dropping the token; provided so call sites can make the
    /// hand-back explicit.
    pub fn release(&self, buffer: PoolBuffer<T>) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &buffer.pool),
            "buffer released to a pool it was not acquired from"
        );
        drop(buffer);
    }

    /// Free every buffer in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::BuffersOutstanding`] if any buffer is still held
    /// by a stage or sits in a queue. Drain the pipeline first.
    pub fn deallocate(self) -> Result<(), PoolError> {
        let mut free = self.inner.free.lock();
        let outstanding = self.inner.pool_size - free.len();
        if outstanding > 0 {
            return Err(PoolError::BuffersOutstanding {
                pool: self.inner.name.clone(),
                outstanding,
            });
        }
        self.inner.torn_down.store(true, Ordering::Release);
        free.clear();
        free.shrink_to_fit();
        debug!(pool = %self.inner.name, "BufferPool deallocated");
        Ok(())
    }

    /// Pool name used in logs and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total number of buffers owned by the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.pool_size
    }

    /// Number of buffers currently on the free-list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Number of buffers held by stages or waiting in queues.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.pool_size - self.available()
    }

    /// Elements in each buffer.
    #[must_use]
    pub fn elements_per_buffer(&self) -> usize {
        self.inner.elements_per_buffer
    }

    /// Total acquisitions since allocation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Total returns since allocation.
    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.pool_size)
            .field("elements_per_buffer", &self.inner.elements_per_buffer)
            .finish()
    }
}

/// An owned frame buffer on loan from a [`BufferPool`].
///
/// Dereferences to `[T]`. The buffer goes back on its pool's free-list when
/// dropped. Contents are **not** zeroed on return: every stage overwrites the
/// whole frame before pushing it downstream.
pub struct PoolBuffer<T> {
    /// `Some` until drop hands the block back.
    data: Option<Box<[T]>>,
    pool: Arc<PoolInner<T>>,
}

impl<T> PoolBuffer<T> {
    /// Valid samples as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Valid samples as a mutable slice.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Name of the pool this buffer belongs to.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Memory address of the block; stable for the pool's lifetime.
    #[must_use]
    pub fn address(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }
}

impl<T> Deref for PoolBuffer<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl<T> DerefMut for PoolBuffer<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl<T> AsRef<[T]> for PoolBuffer<T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> AsMut<[T]> for PoolBuffer<T> {
    fn as_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> Drop for PoolBuffer<T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(data);
        }
    }
}

impl<T> fmt::Debug for PoolBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("pool", &self.pool.name)
            .field("len", &self.as_slice().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_allocate_zero_filled() {
        let pool = BufferPool::<u16>::allocate("test", 64, 3).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.elements_per_buffer(), 64);

        let buf = pool.acquire().unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_allocate_zero_sized_rejected() {
        let err = BufferPool::<u16>::allocate("empty", 64, 0).unwrap_err();
        assert!(matches!(err, PoolError::ZeroSized { buffer_count: 0, .. }));

        let err = BufferPool::<u16>::allocate("empty", 0, 4).unwrap_err();
        assert!(matches!(
            err,
            PoolError::ZeroSized {
                elements_per_buffer: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_exhaustion_is_backpressure() {
        let pool = BufferPool::<u8>::allocate("small", 8, 2).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 2);

        drop(a);
        assert_eq!(pool.available(), 1);
        let _c = pool.acquire().unwrap();
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_contents_survive_recirculation() {
        let pool = BufferPool::<u16>::allocate("reuse", 4, 1).unwrap();
        let mut buf = pool.acquire().unwrap();
        buf.copy_from_slice(&[1, 2, 3, 4]);
        let addr = buf.address();
        pool.release(buf);

        // Same block comes back, not zeroed
        let buf = pool.acquire().unwrap();
        assert_eq!(buf.address(), addr);
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = BufferPool::<u8>::allocate("one", 8, 1).unwrap();
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        assert!(pool.acquire_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_acquire_timeout_woken_by_release() {
        let pool = BufferPool::<u8>::allocate("one", 8, 1).unwrap();
        let held = pool.acquire().unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let buf = pool.acquire_timeout(Duration::from_secs(5));
        assert!(buf.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_deallocate_refuses_outstanding() {
        let pool = BufferPool::<u8>::allocate("busy", 8, 2).unwrap();
        let held = pool.acquire().unwrap();

        let err = pool.clone().deallocate().unwrap_err();
        assert_eq!(
            err,
            PoolError::BuffersOutstanding {
                pool: "busy".into(),
                outstanding: 1
            }
        );

        drop(held);
        assert!(pool.deallocate().is_ok());
    }

    #[test]
    fn test_no_aliasing_under_contention() {
        let pool = BufferPool::<u32>::allocate("contended", 16, 4).unwrap();
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(buf) = pool.acquire_timeout(Duration::from_millis(50)) {
                            // An address may only be live in one place at a time
                            assert!(seen.lock().insert(buf.address()));
                            assert!(pool.available() + pool.outstanding() == pool.size());
                            seen.lock().remove(&buf.address());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.total_acquires(), pool.total_returns());
    }
}
