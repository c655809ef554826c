//! Per-client delivery queue.
//!
//! Each registered client owns one [`ClientQueue`]: a bounded FIFO that the
//! relay pushes into and the client's poll drains. Pushes never block; when
//! the queue is full the oldest pending message is evicted so a stalled
//! reader can never wedge a broadcast. Closing the queue releases any waiting
//! pop, which is how unregistration and supersession interrupt a pending
//! poll.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::message::Message;

/// Queue capacity used for every registration.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued with room to spare.
    Queued,
    /// Enqueued, but the oldest pending message was evicted to make room.
    Evicted,
    /// Dropped because the queue has been closed.
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Message>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO with an async blocking [`pop`](ClientQueue::pop).
///
/// Concurrent pops for the same queue are serialized through an internal
/// gate, so each message is handed to exactly one caller.
#[derive(Debug)]
pub struct ClientQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    poll_gate: Mutex<()>,
    capacity: usize,
}

impl ClientQueue {
    /// Creates a queue holding at most `capacity` pending messages.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            poll_gate: Mutex::new(()),
            capacity,
        }
    }

    /// Enqueues `message` without ever blocking on the consumer.
    pub async fn push(&self, message: Message) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return PushOutcome::Closed;
            }
            let outcome = if inner.items.len() == self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                PushOutcome::Evicted
            } else {
                PushOutcome::Queued
            };
            inner.items.push_back(message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next message. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Message> {
        let _turn = self.poll_gate.lock().await;
        loop {
            // Register interest before checking state so a close or push
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if let Some(message) = inner.items.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue: pending pops finish draining, then return `None`;
    /// later pushes are rejected. Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Number of messages evicted by overflow since creation.
    pub async fn dropped(&self) -> u64 {
        self.inner.lock().await.dropped
    }
}
