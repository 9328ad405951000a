use crate::config::Backpressure;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError<T> {
    /// The queue was closed; the rejected item is handed back to the caller.
    #[error("queue is closed")]
    Closed(T),
    /// The queue is at capacity and the `reject` policy is in effect.
    #[error("queue is at capacity")]
    Full(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Closed(item) | PushError::Full(item) => item,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer/multi-consumer FIFO queue with blocking single-item and
/// best-effort batch dequeue.
///
/// FIFO order holds across all producers and consumers combined. An optional
/// capacity bounds producer-side growth; the configured [`Backpressure`]
/// policy decides whether a full queue blocks the producer or rejects the
/// item. `close()` wakes every waiter: producers get their item back in a
/// [`PushError::Closed`], consumers keep draining until the queue is empty
/// and then receive the stop indication.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
    policy: Backpressure,
}

impl<T> WorkQueue<T> {
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: None,
            policy: Backpressure::Block,
        }
    }

    pub fn bounded(capacity: usize, policy: Backpressure) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: Some(capacity),
            policy,
        }
    }

    pub fn with_capacity(capacity: Option<usize>, policy: Backpressure) -> Self {
        match capacity {
            Some(n) => Self::bounded(n, policy),
            None => Self::unbounded(),
        }
    }

    /// Appends at the tail and wakes one consumer. With a capacity and the
    /// `block` policy this may wait for space; with `reject` it returns the
    /// item in `PushError::Full` instead.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            match self.capacity {
                Some(cap) if inner.items.len() >= cap => match self.policy {
                    Backpressure::Reject => return Err(PushError::Full(item)),
                    Backpressure::Block => {
                        self.not_full.wait(&mut inner);
                    }
                },
                _ => break,
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available, then removes and returns it in
    /// FIFO order. Returns `None` only once the queue is closed and fully
    /// drained.
    pub fn pop_one(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.closed {
            self.not_empty.wait(&mut inner);
        }
        let item = inner.items.pop_front();
        drop(inner);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Blocks until at least one item is available, then drains up to `max`
    /// items already present without waiting for the batch to fill. `max`
    /// is clamped to at least 1 so that an empty vector means exactly one
    /// thing: the queue is closed and fully drained.
    pub fn pop_up_to(&self, max: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.closed {
            self.not_empty.wait(&mut inner);
        }
        let take = max.max(1).min(inner.items.len());
        let batch: Vec<T> = inner.items.drain(..take).collect();
        drop(inner);
        for _ in 0..batch.len() {
            self.not_full.notify_one();
        }
        batch
    }

    /// Marks the queue closed and wakes every waiter. Items already queued
    /// remain poppable until drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}
