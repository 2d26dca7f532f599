//! Blocking FIFO for handing buffer ownership between pipeline stages.
//!
//! # State Machine
//!
//! ```text
//! Empty <-> NonEmpty <-> Draining (sentinel enqueued) -> Closed (sentinel consumed)
//! ```
//!
//! The sentinel is stored in the queue like any other entry, so everything
//! pushed before [`HandoffQueue::close`] is still delivered, in order, before
//! consumers observe the end of the stream. Once the sentinel has been popped
//! the queue is Closed and every later `pop()` returns `None` immediately.
//!
//! `push` never blocks. The queue is bounded indirectly: only as many items
//! exist as the upstream pool has buffers.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

enum Entry<T> {
    Item(T),
    Sentinel,
}

struct QueueState<T> {
    entries: VecDeque<Entry<T>>,
    /// Sentinel has been pushed.
    sentinel_pushed: bool,
    /// Sentinel has been popped.
    closed: bool,
}

struct QueueInner<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

/// Returned by [`HandoffQueue::push`] after the sentinel; hands the item back.
#[derive(Error)]
#[error("push to queue '{queue}' after shutdown sentinel")]
pub struct QueueClosed<T> {
    /// Queue name.
    pub queue: String,
    /// The rejected item, still owned by the caller.
    pub item: T,
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClosed")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`HandoffQueue::pop_timeout`].
#[derive(Debug)]
pub enum Popped<T> {
    /// Head of the queue.
    Item(T),
    /// The sentinel was (or had already been) consumed.
    Closed,
    /// Nothing arrived in time.
    TimedOut,
}

/// Thread-safe FIFO moving one owned item at a time between stages.
///
/// Cloning yields another handle to the same queue.
pub struct HandoffQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> HandoffQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    sentinel_pushed: false,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Append `item` at the tail. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`QueueClosed`] if the sentinel was already
    /// pushed; nothing may follow the sentinel.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.inner.state.lock();
        if state.sentinel_pushed {
            return Err(QueueClosed {
                queue: self.inner.name.clone(),
                item,
            });
        }
        state.entries.push_back(Entry::Item(item));
        drop(state);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Enqueue the shutdown sentinel.
    ///
    /// Returns `false` (and does nothing) if the sentinel was already pushed.
    pub fn close(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.sentinel_pushed {
            warn!(queue = %self.inner.name, "Sentinel already pushed; ignoring second close");
            return false;
        }
        state.sentinel_pushed = true;
        state.entries.push_back(Entry::Sentinel);
        drop(state);
        trace!(queue = %self.inner.name, "Sentinel pushed");
        // Wake every waiter: late callers must observe the sentinel too
        self.inner.available.notify_all();
        true
    }

    /// Remove the head, blocking until an entry is available.
    ///
    /// `None` is the sentinel. It must not be treated as a transient
    /// condition: once returned, every later call returns `None` without
    /// blocking.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(popped) = Self::take_head(&mut state) {
                return popped;
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match Self::take_head(&mut state) {
                Some(Some(item)) => return Popped::Item(item),
                Some(None) => return Popped::Closed,
                None => {}
            }
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match Self::take_head(&mut state) {
                    Some(Some(item)) => Popped::Item(item),
                    Some(None) => Popped::Closed,
                    None => Popped::TimedOut,
                };
            }
        }
    }

    /// `Some(Some(item))` for data, `Some(None)` for the sentinel, `None` if empty.
    fn take_head(state: &mut QueueState<T>) -> Option<Option<T>> {
        if state.closed {
            return Some(None);
        }
        match state.entries.pop_front()? {
            Entry::Item(item) => Some(Some(item)),
            Entry::Sentinel => {
                state.closed = true;
                Some(None)
            }
        }
    }

    /// Best-effort count of queued items (sentinel excluded). Diagnostics only.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Item(_)))
            .count()
    }

    /// Whether no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the sentinel has been consumed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether the sentinel has been pushed; any further `push` is rejected.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().sentinel_pushed
    }

    /// Queue name used in logs and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<T> fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new("fifo");
        for i in 0..100 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 100);
        for i in 0..100 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_items_before_sentinel_are_delivered() {
        let queue = HandoffQueue::new("drain");
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(!queue.is_draining());
        assert!(queue.close());

        assert_eq!(queue.len(), 2);
        assert!(queue.is_draining());
        assert!(!queue.is_closed());
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_closed());
    }

    #[test]
    fn test_sentinel_idempotence() {
        let queue: HandoffQueue<u32> = HandoffQueue::new("idem");
        queue.close();
        assert_eq!(queue.pop(), None);
        // Late callers never block
        for _ in 0..10 {
            assert_eq!(queue.pop(), None);
            assert!(matches!(
                queue.pop_timeout(Duration::from_secs(10)),
                Popped::Closed
            ));
        }
    }

    #[test]
    fn test_push_after_close_returns_item() {
        let queue = HandoffQueue::new("closed");
        queue.close();
        let err = queue.push(String::from("late")).unwrap_err();
        assert_eq!(err.item, "late");
        assert!(!queue.close());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = HandoffQueue::new("blocking");
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(7u8).unwrap();
            })
        };
        assert_eq!(queue.pop(), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_consumers() {
        let queue: HandoffQueue<u8> = HandoffQueue::new("wake");
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: HandoffQueue<u8> = HandoffQueue::new("timeout");
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(10)),
            Popped::TimedOut
        ));
        queue.push(3).unwrap();
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(10)),
            Popped::Item(3)
        ));
    }

    #[test]
    fn test_cross_thread_order_preserved() {
        let queue = HandoffQueue::new("ordered");
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    queue.push(i).unwrap();
                }
                queue.close();
            })
        };

        let mut expected = 0;
        while let Some(i) = queue.pop() {
            assert_eq!(i, expected);
            expected += 1;
        }
        assert_eq!(expected, 10_000);
        producer.join().unwrap();
    }
}
