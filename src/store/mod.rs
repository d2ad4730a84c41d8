//! Desired-state model store
//!
//! The control plane only depends on the narrow [`ModelStore`] capability
//! trait; the full store lives behind it. [`InMemoryModelStore`] is the
//! in-process implementation used by the daemon and the tests.

pub mod memory;
pub mod model;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

pub use memory::InMemoryModelStore;
pub use model::{
    DeploymentSpec, Model, ModelReplicaState, ModelSpec, ModelVersion, ReplicaStatus,
    ServerReplica,
};

use crate::Result;

/// RAII guard for a per-model lock.
///
/// Dropping the guard releases the lock on every exit path of the critical
/// section that acquired it.
#[must_use = "the model lock is released as soon as the guard is dropped"]
pub struct ModelLock {
    _guard: OwnedMutexGuard<()>,
}

impl ModelLock {
    pub(crate) fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// The store operations the agent-facing control plane uses.
///
/// Kept deliberately narrow so the server, the store and the scheduler can
/// reference each other without cycles.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Acquire the per-model lock. Concurrent critical sections for the
    /// same model serialize on this; different models proceed in parallel.
    async fn lock_model(&self, name: &str) -> ModelLock;

    /// Fetch a snapshot of a model, or `None` if it does not exist.
    async fn get_model(&self, name: &str) -> Result<Option<Model>>;

    /// Transition one replica of one model version from `expected` to
    /// `desired`, recording the agent-reported detail. Fails if the current
    /// state is not `expected` (unless `desired` is
    /// [`ModelReplicaState::Unknown`], which is recorded unconditionally).
    /// When the agent reported its remaining memory, the replica's capacity
    /// record is refreshed too.
    #[allow(clippy::too_many_arguments)]
    async fn update_model_state(
        &self,
        name: &str,
        version: u32,
        server: &str,
        replica_idx: u32,
        available_memory_bytes: Option<u64>,
        expected: ModelReplicaState,
        desired: ModelReplicaState,
        reason: &str,
    ) -> Result<()>;

    /// Apply a full model definition: update the latest version's
    /// deployment spec in place, or create version 1 for a new model.
    async fn update_model(&self, spec: ModelSpec) -> Result<()>;

    /// Admit a server replica with its advertised capacity.
    async fn add_server_replica(&self, replica: ServerReplica) -> Result<()>;

    /// Remove a server replica and clear its assignments everywhere,
    /// returning the names of the models that lost capacity.
    async fn remove_server_replica(&self, server_name: &str, replica_idx: u32)
        -> Result<Vec<String>>;
}
