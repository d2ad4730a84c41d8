//! In-memory desired-state store
//!
//! Holds models, their versions and replica states, plus the set of
//! registered server replicas with remaining capacity. Every mutation
//! publishes a model event so the agent server reconciles the change onto
//! the affected replica streams.
//!
//! Two locking layers: a short internal mutex guards the maps themselves,
//! and a name-keyed async lock table provides the per-model critical
//! sections the reconciler and the status ingestor hold across sends.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::events::{EventHub, ModelEvent};
use crate::{Error, Result};

use super::model::{
    Model, ModelReplicaState, ModelSpec, ModelVersion, ReplicaStatus, ServerReplica,
};
use super::{ModelLock, ModelStore};

/// Capacity snapshot for one registered server replica.
#[derive(Debug, Clone)]
pub struct ReplicaCapacity {
    /// Replica index within its server.
    pub replica_idx: u32,
    /// Memory advertised at subscription, in bytes.
    pub memory_bytes: u64,
    /// Memory still free per the agent's last status report, in bytes.
    pub available_memory_bytes: u64,
    /// Maximum concurrent models the replica will host.
    pub capacity: u32,
}

/// In-memory [`ModelStore`] implementation.
#[derive(Default)]
pub struct InMemoryModelStore {
    models: Mutex<HashMap<String, Model>>,
    servers: Mutex<HashMap<String, HashMap<u32, ReplicaCapacity>>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    placement_failed: Mutex<HashSet<String>>,
    hub: Option<Arc<EventHub>>,
}

impl InMemoryModelStore {
    /// Create an empty store that publishes no events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the event hub that model mutations publish to.
    pub fn with_event_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, Model>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, HashMap<u32, ReplicaCapacity>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.placement_failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, model_name: &str, version: u32) {
        if let Some(hub) = &self.hub {
            hub.publish_model_event(
                "store",
                ModelEvent {
                    model_name: model_name.to_string(),
                    version,
                },
            );
        }
    }

    /// Insert or replace a model wholesale.
    pub fn insert_model(&self, model: Model) {
        let name = model.name.clone();
        let version = model.latest().map(|v| v.version).unwrap_or_default();
        self.models().insert(name.clone(), model);
        self.publish(&name, version);
    }

    /// Snapshot of all registered server replicas, grouped by server, in
    /// ascending replica order.
    pub fn server_replicas(&self) -> HashMap<String, Vec<ReplicaCapacity>> {
        self.servers()
            .iter()
            .map(|(name, replicas)| {
                let mut caps: Vec<ReplicaCapacity> = replicas.values().cloned().collect();
                caps.sort_unstable_by_key(|cap| cap.replica_idx);
                (name.clone(), caps)
            })
            .collect()
    }

    /// Bind a model version to a server if it is not bound yet.
    pub fn bind_version_server(&self, name: &str, version: u32, server: &str) -> Result<()> {
        let mut models = self.models();
        let model = models
            .get_mut(name)
            .ok_or_else(|| Error::store(format!("model {name} not found")))?;
        let target = model
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| Error::store(format!("model {name} has no version {version}")))?;
        if target.server.is_none() {
            target.server = Some(server.to_string());
        }
        Ok(())
    }

    /// Put one replica of one version into `state` unconditionally, used by
    /// the scheduler to request loads and unloads.
    pub fn request_replica_state(
        &self,
        name: &str,
        version: u32,
        replica_idx: u32,
        state: ModelReplicaState,
    ) -> Result<()> {
        {
            let mut models = self.models();
            let model = models
                .get_mut(name)
                .ok_or_else(|| Error::store(format!("model {name} not found")))?;
            let target = model
                .versions
                .iter_mut()
                .find(|v| v.version == version)
                .ok_or_else(|| Error::store(format!("model {name} has no version {version}")))?;
            target.replicas.insert(replica_idx, ReplicaStatus::new(state));
            target.last_change = Utc::now();
        }
        self.publish(name, version);
        Ok(())
    }

    /// Remember that placement for this model could not be satisfied.
    pub fn mark_placement_failed(&self, name: &str) {
        self.failed().insert(name.to_string());
    }

    /// Forget a previously recorded placement failure.
    pub fn clear_placement_failed(&self, name: &str) {
        self.failed().remove(name);
    }

    /// Models whose last placement attempt failed, in name order.
    pub fn placement_failed_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.failed().iter().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn lock_model(&self, name: &str) -> ModelLock {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_default()
            .clone();
        ModelLock::new(lock.lock_owned().await)
    }

    async fn get_model(&self, name: &str) -> Result<Option<Model>> {
        Ok(self.models().get(name).cloned())
    }

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
    ) -> Result<()> {
        {
            let mut models = self.models();
            let model = models
                .get_mut(name)
                .ok_or_else(|| Error::store(format!("model {name} not found")))?;
            let target = model
                .versions
                .iter_mut()
                .find(|v| v.version == version)
                .ok_or_else(|| Error::store(format!("model {name} has no version {version}")))?;

            let current = target
                .replicas
                .get(&replica_idx)
                .map(|status| status.state)
                .unwrap_or(ModelReplicaState::Unknown);

            if desired != ModelReplicaState::Unknown && current != expected {
                return Err(Error::store(format!(
                    "replica {server}:{replica_idx} of model {name}:{version} \
                     is {current}, expected {expected}"
                )));
            }

            let now = Utc::now();
            target.replicas.insert(
                replica_idx,
                ReplicaStatus {
                    state: desired,
                    reason: reason.to_string(),
                    timestamp: now,
                },
            );
            target.last_change = now;
        }

        if let Some(available) = available_memory_bytes {
            let mut servers = self.servers();
            if let Some(replica) = servers
                .get_mut(server)
                .and_then(|replicas| replicas.get_mut(&replica_idx))
            {
                replica.available_memory_bytes = available;
            }
        }

        self.publish(name, version);
        Ok(())
    }

    async fn update_model(&self, spec: ModelSpec) -> Result<()> {
        let version = {
            let mut models = self.models();
            match models.get_mut(&spec.name) {
                Some(model) => {
                    let latest = model
                        .latest_mut()
                        .ok_or_else(|| Error::store(format!("model {} has no versions", spec.name)))?;
                    latest.spec = spec.deployment;
                    latest.version
                }
                None => {
                    models.insert(
                        spec.name.clone(),
                        Model::new(spec.name.clone(), ModelVersion::new(1, spec.deployment)),
                    );
                    1
                }
            }
        };
        self.publish(&spec.name, version);
        Ok(())
    }

    async fn add_server_replica(&self, replica: ServerReplica) -> Result<()> {
        debug!(
            server = %replica.server_name,
            replica = replica.replica_idx,
            memory = replica.memory_bytes,
            "registering server replica"
        );
        self.servers()
            .entry(replica.server_name.clone())
            .or_default()
            .insert(
                replica.replica_idx,
                ReplicaCapacity {
                    replica_idx: replica.replica_idx,
                    memory_bytes: replica.memory_bytes,
                    available_memory_bytes: replica.memory_bytes,
                    capacity: replica.capacity,
                },
            );
        Ok(())
    }

    async fn remove_server_replica(
        &self,
        server_name: &str,
        replica_idx: u32,
    ) -> Result<Vec<String>> {
        {
            let mut servers = self.servers();
            if let Some(replicas) = servers.get_mut(server_name) {
                replicas.remove(&replica_idx);
                if replicas.is_empty() {
                    servers.remove(server_name);
                }
            }
        }

        let mut changed: Vec<String> = Vec::new();
        {
            let mut models = self.models();
            for (name, model) in models.iter_mut() {
                for version in model.versions.iter_mut() {
                    if version.server.as_deref() != Some(server_name) {
                        continue;
                    }
                    if version.replicas.remove(&replica_idx).is_some() {
                        version.last_change = Utc::now();
                        if !changed.contains(name) {
                            changed.push(name.clone());
                        }
                    }
                }
            }
        }
        changed.sort_unstable();
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::DeploymentSpec;
    use std::time::Duration;

    fn spec(replicas: u32) -> DeploymentSpec {
        DeploymentSpec {
            replicas,
            ..Default::default()
        }
    }

    fn seeded_store() -> InMemoryModelStore {
        let store = InMemoryModelStore::new();
        store.insert_model(Model::new(
            "m1",
            ModelVersion::new(3, spec(1))
                .with_server("serverS")
                .with_replica_state(0, ModelReplicaState::Loading),
        ));
        store
    }

    #[tokio::test]
    async fn state_transition_law_holds() {
        let store = seeded_store();

        store
            .update_model_state(
                "m1",
                3,
                "serverS",
                0,
                Some(1024),
                ModelReplicaState::Loading,
                ModelReplicaState::Loaded,
                "",
            )
            .await
            .unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        assert_eq!(
            model.version(3).unwrap().replicas[&0].state,
            ModelReplicaState::Loaded
        );
    }

    #[tokio::test]
    async fn mismatched_expected_state_is_rejected() {
        let store = seeded_store();

        let err = store
            .update_model_state(
                "m1",
                3,
                "serverS",
                0,
                None,
                ModelReplicaState::Unloading,
                ModelReplicaState::Unloaded,
                "",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Store(_)));
        let model = store.get_model("m1").await.unwrap().unwrap();
        assert_eq!(
            model.version(3).unwrap().replicas[&0].state,
            ModelReplicaState::Loading
        );
    }

    #[tokio::test]
    async fn unknown_desired_state_skips_the_expected_check() {
        let store = seeded_store();

        store
            .update_model_state(
                "m1",
                3,
                "serverS",
                0,
                None,
                ModelReplicaState::Unknown,
                ModelReplicaState::Unknown,
                "unrecognized event",
            )
            .await
            .unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        let status = &model.version(3).unwrap().replicas[&0];
        assert_eq!(status.state, ModelReplicaState::Unknown);
        assert_eq!(status.reason, "unrecognized event");
    }

    #[tokio::test]
    async fn status_update_refreshes_replica_capacity() {
        let store = seeded_store();
        store
            .add_server_replica(ServerReplica {
                server_name: "serverS".to_string(),
                replica_idx: 0,
                memory_bytes: 4096,
                capacity: 4,
            })
            .await
            .unwrap();

        store
            .update_model_state(
                "m1",
                3,
                "serverS",
                0,
                Some(1024),
                ModelReplicaState::Loading,
                ModelReplicaState::Loaded,
                "",
            )
            .await
            .unwrap();

        let servers = store.server_replicas();
        assert_eq!(servers["serverS"][0].available_memory_bytes, 1024);
    }

    #[tokio::test]
    async fn update_model_creates_version_one_for_new_models() {
        let store = InMemoryModelStore::new();
        store
            .update_model(ModelSpec {
                name: "fresh".to_string(),
                deployment: spec(2),
            })
            .await
            .unwrap();

        let model = store.get_model("fresh").await.unwrap().unwrap();
        assert_eq!(model.latest().unwrap().version, 1);
        assert_eq!(model.latest().unwrap().spec.replicas, 2);
    }

    #[tokio::test]
    async fn update_model_rewrites_the_latest_spec_in_place() {
        let store = seeded_store();
        store
            .update_model(ModelSpec {
                name: "m1".to_string(),
                deployment: spec(5),
            })
            .await
            .unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        assert_eq!(model.versions.len(), 1);
        assert_eq!(model.latest().unwrap().spec.replicas, 5);
        // The replica map is untouched; only the spec changes.
        assert_eq!(
            model.latest().unwrap().replicas[&0].state,
            ModelReplicaState::Loading
        );
    }

    #[tokio::test]
    async fn remove_server_replica_returns_disturbed_models() {
        let store = InMemoryModelStore::new();
        for name in ["m4", "m5"] {
            store.insert_model(Model::new(
                name,
                ModelVersion::new(1, spec(1))
                    .with_server("serverU")
                    .with_replica_state(0, ModelReplicaState::Loaded),
            ));
        }
        store.insert_model(Model::new(
            "other",
            ModelVersion::new(1, spec(1))
                .with_server("serverV")
                .with_replica_state(0, ModelReplicaState::Loaded),
        ));

        let changed = store.remove_server_replica("serverU", 0).await.unwrap();
        assert_eq!(changed, vec!["m4".to_string(), "m5".to_string()]);

        // The assignment is gone; the unrelated model is untouched.
        let m4 = store.get_model("m4").await.unwrap().unwrap();
        assert!(m4.version(1).unwrap().replicas.is_empty());
        let other = store.get_model("other").await.unwrap().unwrap();
        assert_eq!(other.version(1).unwrap().replicas.len(), 1);
    }

    #[tokio::test]
    async fn per_model_locks_serialize_critical_sections() {
        let store = Arc::new(InMemoryModelStore::new());

        let first = store.lock_model("m1").await;

        let contender = store.clone();
        let handle = tokio::spawn(async move {
            let _second = contender.lock_model("m1").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn locks_for_different_models_are_independent() {
        let store = InMemoryModelStore::new();
        let _m1 = store.lock_model("m1").await;
        // Must not deadlock.
        let _m2 = store.lock_model("m2").await;
    }

    #[tokio::test]
    async fn placement_failure_bookkeeping() {
        let store = InMemoryModelStore::new();
        store.mark_placement_failed("m2");
        store.mark_placement_failed("m1");
        assert_eq!(
            store.placement_failed_models(),
            vec!["m1".to_string(), "m2".to_string()]
        );

        store.clear_placement_failed("m1");
        assert_eq!(store.placement_failed_models(), vec!["m2".to_string()]);
    }
}
