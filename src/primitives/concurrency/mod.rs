#![forbid(unsafe_code)]

//! Blocking hand-off queues and first-error latching for the loader pipeline.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::types::FtError;

/// Multi-producer multi-consumer FIFO with a fixed capacity.
///
/// `push` blocks while the queue is full and `pop` blocks while it is empty.
/// After [`BoundedQueue::close`] producers are rejected and consumers drain the
/// remaining items before seeing `None`.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, waiting for room. Returns the item back if the queue
    /// was closed.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut guard = self.state.lock();
        while !guard.closed && guard.items.len() >= self.capacity {
            self.not_full.wait(&mut guard);
        }
        if guard.closed {
            return Err(item);
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the oldest item, waiting while the queue is open and empty.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            self.not_empty.wait(&mut guard);
        }
    }

    /// Stops accepting items and wakes every waiter.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Closes the queue and drops everything still in it. Returns the number
    /// of items discarded.
    pub fn drain(&self) -> usize {
        let dropped: Vec<T> = {
            let mut guard = self.state.lock();
            guard.closed = true;
            self.not_empty.notify_all();
            self.not_full.notify_all();
            guard.items.drain(..).collect()
        };
        dropped.len()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Keeps the first error reported by any pipeline stage.
///
/// Later errors are dropped. Stages poll [`ErrorLatch::is_set`] between units
/// of work and unwind once it flips.
#[derive(Default)]
pub struct ErrorLatch {
    set: AtomicBool,
    first: Mutex<Option<FtError>>,
}

impl ErrorLatch {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `err` if no error was latched yet. Returns true if this call
    /// latched it.
    pub fn latch(&self, err: FtError) -> bool {
        let mut guard = self.first.lock();
        if guard.is_some() {
            return false;
        }
        warn!(error = %err, "loader.error.latched");
        *guard = Some(err);
        self.set.store(true, Ordering::Release);
        true
    }

    /// True once any error was latched.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Copy of the latched error, if any.
    pub fn get(&self) -> Option<FtError> {
        self.first.lock().as_ref().map(clone_error)
    }

    /// Removes and returns the latched error.
    pub fn take(&self) -> Option<FtError> {
        self.first.lock().take()
    }
}

/// Duplicates an error so it can be reported to more than one waiter.
pub fn clone_error(err: &FtError) -> FtError {
    match err {
        FtError::Io(io_err) => FtError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        FtError::BadFormat(msg) => FtError::BadFormat(msg),
        FtError::BadFormatDetail(msg) => FtError::BadFormatDetail(msg.clone()),
        FtError::BadChecksum {
            what,
            stored,
            computed,
        } => FtError::BadChecksum {
            what,
            stored: *stored,
            computed: *computed,
        },
        FtError::BadVersion(v) => FtError::BadVersion(*v),
        FtError::DuplicateKey { index, key } => FtError::DuplicateKey {
            index: *index,
            key: key.clone(),
        },
        FtError::RowTooLarge {
            key_len,
            val_len,
            limit,
        } => FtError::RowTooLarge {
            key_len: *key_len,
            val_len: *val_len,
            limit: *limit,
        },
        FtError::Resource(msg) => FtError::Resource(msg.clone()),
        FtError::TryAgain => FtError::TryAgain,
        FtError::Cancelled => FtError::Cancelled,
        FtError::PartitionUnavailable(i) => FtError::PartitionUnavailable(*i),
        FtError::Invalid(msg) => FtError::Invalid(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn queue_is_fifo_across_threads() {
        let queue = Arc::new(BoundedQueue::new(2));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..100u32 {
                    queue.push(i).unwrap();
                }
                queue.close();
            })
        };
        let mut seen = Vec::new();
        while let Some(v) = queue.pop() {
            assert!(queue.len() <= queue.capacity());
            seen.push(v);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn push_after_close_returns_item() {
        let queue = BoundedQueue::new(1);
        queue.close();
        assert_eq!(queue.push(7), Err(7));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn drain_unblocks_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1u8).unwrap();
        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2u8))
        };
        while queue.len() < 1 {
            thread::yield_now();
        }
        let dropped = queue.drain();
        assert!(dropped >= 1);
        let _ = blocked.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn latch_keeps_first_error() {
        let latch = ErrorLatch::new();
        assert!(!latch.is_set());
        assert!(latch.latch(FtError::Cancelled));
        assert!(!latch.latch(FtError::TryAgain));
        assert!(latch.is_set());
        assert!(matches!(latch.get(), Some(FtError::Cancelled)));
        assert!(matches!(latch.take(), Some(FtError::Cancelled)));
    }
}
