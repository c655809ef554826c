//! The message distribution engine.
//!
//! One [`Relay`] holds the registry (client id → queue) and the append-only
//! history behind a single lock. `register`, `send`, and `unregister` mutate
//! that shared state; `poll` waits on the caller's own queue without holding
//! the shared lock. Broadcast appends to history and copies the recipient
//! set in one critical section, so a concurrent registration sees either the
//! history without the new message or with it, never a torn view, and two
//! broadcasts can never reach a shared recipient in different orders.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message::{ErrorKind, Message};
use crate::queue::{ClientQueue, PushOutcome, DEFAULT_QUEUE_CAPACITY};

/// Failures reported to callers of the four relay operations. All of them
/// are per-request conditions; none end the relay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// `register` was called with an empty client id.
    #[error("client id must not be empty")]
    InvalidClientId,
    /// `send` was called with an empty sender.
    #[error("sender must not be empty")]
    InvalidSender,
    /// `poll` was called for an id with no live registration.
    #[error("client '{0}' is not registered")]
    NotRegistered(String),
    /// The queue a `poll` was waiting on was invalidated by `unregister`
    /// or by a re-registration under the same id.
    #[error("client was unregistered or superseded while polling")]
    ClientGone,
}

impl RelayError {
    /// Stable wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InvalidClientId => ErrorKind::InvalidClientId,
            RelayError::InvalidSender => ErrorKind::InvalidSender,
            RelayError::NotRegistered(_) => ErrorKind::NotRegistered,
            RelayError::ClientGone => ErrorKind::ClientGone,
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    history: Vec<Message>,
    clients: HashMap<String, Arc<ClientQueue>>,
}

/// Shared chat state plus the operations the transport exposes.
#[derive(Debug)]
pub struct Relay {
    state: Mutex<RelayState>,
    queue_capacity: usize,
}

impl Relay {
    /// Relay with the default per-client queue capacity.
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Relay whose per-client queues hold at most `queue_capacity` pending
    /// messages before drop-oldest kicks in.
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            queue_capacity,
        }
    }

    /// Registers `client_id` and returns the history snapshot taken before
    /// the join notice is broadcast, so callers never see their own join.
    ///
    /// Re-registering an id supersedes the previous queue: it is closed
    /// (releasing any poll blocked on it) and replaced with an empty one.
    pub async fn register(&self, client_id: &str) -> Result<Vec<Message>, RelayError> {
        if client_id.is_empty() {
            return Err(RelayError::InvalidClientId);
        }
        let queue = Arc::new(ClientQueue::new(self.queue_capacity));
        let superseded;
        let snapshot;
        {
            let mut state = self.state.lock().await;
            snapshot = state.history.clone();
            superseded = state.clients.insert(client_id.to_string(), queue);
            if let Some(old) = &superseded {
                old.close().await;
            }
            Self::broadcast_locked(&mut state, Message::join_notice(client_id), client_id).await;
        }
        if superseded.is_some() {
            info!(client = client_id, "client re-registered, previous queue superseded");
        } else {
            info!(client = client_id, "client registered");
        }
        Ok(snapshot)
    }

    /// Broadcasts a user message from `from` to every other client.
    ///
    /// Succeeds once the message is in history; delivery problems of
    /// individual recipients are never surfaced to the sender.
    pub async fn send(&self, from: &str, text: &str) -> Result<(), RelayError> {
        if from.is_empty() {
            return Err(RelayError::InvalidSender);
        }
        let message = Message::user(from, text);
        let mut state = self.state.lock().await;
        Self::broadcast_locked(&mut state, message, from).await;
        debug!(from, "message broadcast");
        Ok(())
    }

    /// Waits for the next message queued for `client_id`.
    ///
    /// Concurrent polls for the same id are served one message each, in the
    /// order they arrived. The shared lock is only held for the registry
    /// lookup, never while waiting.
    pub async fn poll(&self, client_id: &str) -> Result<Message, RelayError> {
        let queue = {
            let state = self.state.lock().await;
            match state.clients.get(client_id) {
                Some(queue) => Arc::clone(queue),
                None => return Err(RelayError::NotRegistered(client_id.to_string())),
            }
        };
        match queue.pop().await {
            Some(message) => Ok(message),
            None => Err(RelayError::ClientGone),
        }
    }

    /// Removes `client_id` and closes its queue, waking any blocked poll
    /// with `ClientGone`. Returns whether the id was registered.
    pub async fn unregister(&self, client_id: &str) -> bool {
        let removed = self.state.lock().await.clients.remove(client_id);
        match removed {
            Some(queue) => {
                queue.close().await;
                info!(client = client_id, "client unregistered");
                true
            }
            None => false,
        }
    }

    /// Unregisters everyone. Used on server shutdown so pending polls
    /// resolve instead of dying with the connection.
    pub async fn close_all(&self) {
        let queues: Vec<Arc<ClientQueue>> = {
            let mut state = self.state.lock().await;
            state.clients.drain().map(|(_, queue)| queue).collect()
        };
        for queue in &queues {
            queue.close().await;
        }
        if !queues.is_empty() {
            info!(clients = queues.len(), "released all registered clients");
        }
    }

    /// Number of currently registered clients.
    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Appends to history and delivers to every queue except `exclude_id`,
    /// all under the state lock. Pushes are non-blocking, so the critical
    /// section stays short while keeping per-client delivery order equal to
    /// history order.
    async fn broadcast_locked(state: &mut RelayState, message: Message, exclude_id: &str) {
        state.history.push(message.clone());
        let recipients: Vec<(String, Arc<ClientQueue>)> = state
            .clients
            .iter()
            .filter(|(id, _)| id.as_str() != exclude_id)
            .map(|(id, queue)| (id.clone(), Arc::clone(queue)))
            .collect();
        for (id, queue) in recipients {
            match queue.push(message.clone()).await {
                PushOutcome::Queued => {}
                PushOutcome::Evicted => {
                    warn!(client = %id, "queue full, dropped oldest pending message");
                }
                PushOutcome::Closed => {
                    debug!(client = %id, "skipped delivery to a closed queue");
                }
            }
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}
