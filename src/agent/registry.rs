//! Subscriber registry - tracks connected replica streams
//!
//! Maps (server name, replica index) to the active outbound stream handle.
//! The map itself sits behind a readers/writer lock that is only ever held
//! for a lookup or a mutation, never across a send or a store call. Each
//! subscriber carries its own send lock because a gRPC stream permits only
//! one concurrent send; the per-subscriber lock lets the reconciler fan out
//! to many replicas in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::proto::ModelOperationMessage;
use crate::{Error, Result};

/// Identity of one replica process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaKey {
    /// Inference server name.
    pub server_name: String,
    /// Replica index within the server.
    pub replica_idx: u32,
}

impl ReplicaKey {
    /// Create a key from its parts.
    pub fn new(server_name: impl Into<String>, replica_idx: u32) -> Self {
        Self {
            server_name: server_name.into(),
            replica_idx,
        }
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_name, self.replica_idx)
    }
}

/// One connected replica session.
pub struct AgentSubscriber {
    stream_tx: mpsc::Sender<ModelOperationMessage>,
    // gRPC streams are not safe for concurrent sends; one message at a time.
    send_lock: Mutex<()>,
    done_tx: mpsc::Sender<()>,
}

impl AgentSubscriber {
    /// Create a subscriber around its outbound channel and close signal.
    pub fn new(stream_tx: mpsc::Sender<ModelOperationMessage>, done_tx: mpsc::Sender<()>) -> Self {
        Self {
            stream_tx,
            send_lock: Mutex::new(()),
            done_tx,
        }
    }

    /// Send one message down the replica's stream, holding the send lock
    /// for the duration of exactly that message.
    pub async fn send(&self, message: ModelOperationMessage) -> Result<()> {
        let _sending = self.send_lock.lock().await;
        self.stream_tx
            .send(message)
            .await
            .map_err(|_| Error::transport("stream closed"))
    }

    /// Signal the session to close from the server side.
    pub fn close(&self) {
        let _ = self.done_tx.try_send(());
    }
}

/// Shared handle to the subscriber registry.
pub type SharedSubscriberRegistry = Arc<SubscriberRegistry>;

/// Registry of connected replica sessions.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<ReplicaKey, Arc<AgentSubscriber>>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ReplicaKey, Arc<AgentSubscriber>>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ReplicaKey, Arc<AgentSubscriber>>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a subscriber, replacing any prior session for the key. The
    /// replaced session terminates through its own disconnect path.
    pub fn add(&self, key: ReplicaKey, subscriber: Arc<AgentSubscriber>) {
        if self.write().insert(key.clone(), subscriber).is_some() {
            debug!(replica = %key, "replaced existing subscriber");
        }
    }

    /// Remove whatever subscriber holds the key.
    pub fn remove(&self, key: &ReplicaKey) {
        self.write().remove(key);
    }

    /// Remove the key only if it still maps to `subscriber`, so a stale
    /// session can never evict the session that replaced it.
    pub fn remove_if(&self, key: &ReplicaKey, subscriber: &Arc<AgentSubscriber>) -> bool {
        let mut subscribers = self.write();
        match subscribers.get(key) {
            Some(current) if Arc::ptr_eq(current, subscriber) => {
                subscribers.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Look up the subscriber for a key.
    pub fn get(&self, key: &ReplicaKey) -> Option<Arc<AgentSubscriber>> {
        self.read().get(key).cloned()
    }

    /// Send one message to the replica identified by `key`.
    ///
    /// Fails with [`Error::NotFound`] when no session exists and with
    /// [`Error::Transport`] when the stream rejects the message. The caller
    /// treats both as per-replica failures and does not roll back the store.
    pub async fn send(&self, key: &ReplicaKey, message: ModelOperationMessage) -> Result<()> {
        let subscriber = self
            .get(key)
            .ok_or_else(|| Error::not_found(format!("no subscriber for replica {key}")))?;
        subscriber.send(message).await
    }

    /// Number of connected sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no sessions are connected.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
