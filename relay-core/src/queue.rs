//! Bounded, non-blocking inter-thread queues. `std::sync::mpsc::sync_channel`
//! already gives us exactly the semantics the engine needs: a fixed
//! capacity and a `try_send` that never blocks the producer, so a full
//! queue drops work instead of stalling a worker thread.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

pub struct QueueSender<T> {
    inner: SyncSender<T>,
}

pub struct QueueReceiver<T> {
    inner: Receiver<T>,
}

/// Creates a bounded queue pair with the given capacity.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (QueueSender { inner: tx }, QueueReceiver { inner: rx })
}

impl<T> QueueSender<T> {
    /// Attempts to enqueue `item`. Returns `false` (and drops the item) if
    /// the queue is full or the receiving end has hung up — callers never
    /// block waiting for room.
    #[inline]
    pub fn offer(&self, item: T) -> bool {
        match self.inner.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Drains at most `limit` items currently available without blocking.
    #[inline]
    pub fn drain(&self, limit: usize, mut handler: impl FnMut(T)) -> usize {
        let mut count = 0;
        while count < limit {
            match self.inner.try_recv() {
                Ok(item) => {
                    handler(item);
                    count += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        count
    }

    /// Blocks until an item is available. Used by the worker loops that
    /// suspend on a queue dequeue rather than a selector (Ingress Reader's
    /// UDP/TCP offers aside, this is the consumer side: UDP Relay send,
    /// Egress Writer). Returns `None` once every sender has disconnected,
    /// which only happens during engine teardown.
    #[inline]
    pub fn recv_blocking(&self) -> Option<T> {
        self.inner.recv().ok()
    }

    /// Attempts to take a single item without blocking.
    #[inline]
    pub fn try_recv_one(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }
}
