//! Placement scheduler seam
//!
//! The control plane never decides placement itself; it calls through the
//! [`Scheduler`] trait. [`SimpleScheduler`] is the reference implementation
//! the daemon wires up: it binds a model's latest version to one server,
//! requests loads for missing replicas and unloads for excess ones, and
//! remembers models that found no capacity so they are retried when new
//! replicas subscribe.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::store::memory::ReplicaCapacity;
use crate::store::{InMemoryModelStore, ModelReplicaState, ModelStore};
use crate::{Error, Result};

/// The scheduler operations the agent-facing control plane invokes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run one placement pass for a model.
    async fn schedule(&self, model_name: &str) -> Result<()>;

    /// Retry every model whose last placement failed, returning the names
    /// that now succeeded.
    async fn schedule_failed_models(&self) -> Result<Vec<String>>;
}

/// Capacity-based reference scheduler over the in-memory store.
pub struct SimpleScheduler {
    store: Arc<InMemoryModelStore>,
}

impl SimpleScheduler {
    /// Create a scheduler over the given store.
    pub fn new(store: Arc<InMemoryModelStore>) -> Self {
        Self { store }
    }

    /// Pick the server with the most replicas able to host the model.
    fn pick_server(
        servers: &std::collections::HashMap<String, Vec<ReplicaCapacity>>,
        memory_bytes: u64,
    ) -> Option<String> {
        servers
            .iter()
            .map(|(name, replicas)| {
                let eligible = replicas
                    .iter()
                    .filter(|cap| cap.available_memory_bytes >= memory_bytes)
                    .count();
                (name.clone(), eligible)
            })
            .filter(|(_, eligible)| *eligible > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(name, _)| name)
    }
}

#[async_trait]
impl Scheduler for SimpleScheduler {
    async fn schedule(&self, model_name: &str) -> Result<()> {
        let _lock = self.store.lock_model(model_name).await;

        let model = self
            .store
            .get_model(model_name)
            .await?
            .ok_or_else(|| Error::not_found(format!("model {model_name} not found")))?;
        let latest = model
            .latest()
            .ok_or_else(|| Error::not_found(format!("model {model_name} has no versions")))?;

        let desired = latest.spec.replicas.max(1) as usize;
        let assigned = latest.assignment();

        if assigned.len() < desired {
            let needed = desired - assigned.len();
            let servers = self.store.server_replicas();

            let server_name = match &latest.server {
                Some(server) => server.clone(),
                None => match Self::pick_server(&servers, latest.spec.memory_bytes) {
                    Some(server) => server,
                    None => {
                        self.store.mark_placement_failed(model_name);
                        return Err(Error::scheduling(format!(
                            "no server has capacity for model {model_name}"
                        )));
                    }
                },
            };

            let candidates: Vec<u32> = servers
                .get(&server_name)
                .map(|replicas| {
                    replicas
                        .iter()
                        .filter(|cap| {
                            cap.available_memory_bytes >= latest.spec.memory_bytes
                                && !assigned.contains(&cap.replica_idx)
                        })
                        .map(|cap| cap.replica_idx)
                        .collect()
                })
                .unwrap_or_default();

            self.store
                .bind_version_server(model_name, latest.version, &server_name)?;

            let mut placed = 0;
            for replica_idx in candidates.into_iter().take(needed) {
                self.store.request_replica_state(
                    model_name,
                    latest.version,
                    replica_idx,
                    ModelReplicaState::LoadRequested,
                )?;
                placed += 1;
            }

            if placed < needed {
                info!(
                    model = %model_name,
                    placed,
                    needed,
                    "insufficient capacity, will retry when replicas join"
                );
                self.store.mark_placement_failed(model_name);
                return Err(Error::scheduling(format!(
                    "placed {placed} of {needed} replicas for model {model_name}"
                )));
            }
            debug!(model = %model_name, server = %server_name, placed, "placement complete");
        } else if assigned.len() > desired {
            let excess = assigned.len() - desired;
            for replica_idx in assigned.into_iter().rev().take(excess) {
                self.store.request_replica_state(
                    model_name,
                    latest.version,
                    replica_idx,
                    ModelReplicaState::UnloadRequested,
                )?;
            }
            debug!(model = %model_name, excess, "requested scale-down unloads");
        }

        self.store.clear_placement_failed(model_name);
        Ok(())
    }

    async fn schedule_failed_models(&self) -> Result<Vec<String>> {
        let mut scheduled = Vec::new();
        for model_name in self.store.placement_failed_models() {
            match self.schedule(&model_name).await {
                Ok(()) => scheduled.push(model_name),
                Err(err) => {
                    debug!(model = %model_name, error = %err, "placement retry still failing")
                }
            }
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeploymentSpec, Model, ModelVersion, ServerReplica};

    fn spec(replicas: u32) -> DeploymentSpec {
        DeploymentSpec {
            replicas,
            memory_bytes: 1024,
            ..Default::default()
        }
    }

    async fn register_replicas(store: &InMemoryModelStore, server: &str, count: u32) {
        for idx in 0..count {
            store
                .add_server_replica(ServerReplica {
                    server_name: server.to_string(),
                    replica_idx: idx,
                    memory_bytes: 8192,
                    capacity: 4,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn schedule_requests_loads_up_to_desired() {
        let store = Arc::new(InMemoryModelStore::new());
        register_replicas(&store, "serverA", 3).await;
        store.insert_model(Model::new("m1", ModelVersion::new(1, spec(2))));

        let scheduler = SimpleScheduler::new(store.clone());
        scheduler.schedule("m1").await.unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        let latest = model.latest().unwrap();
        assert_eq!(latest.server.as_deref(), Some("serverA"));
        assert_eq!(
            latest.replicas_in_state(ModelReplicaState::LoadRequested),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn schedule_without_capacity_records_the_failure() {
        let store = Arc::new(InMemoryModelStore::new());
        store.insert_model(Model::new("m1", ModelVersion::new(1, spec(1))));

        let scheduler = SimpleScheduler::new(store.clone());
        let err = scheduler.schedule("m1").await.unwrap_err();
        assert!(matches!(err, Error::Scheduling(_)));
        assert_eq!(store.placement_failed_models(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn failed_models_are_retried_once_capacity_arrives() {
        let store = Arc::new(InMemoryModelStore::new());
        store.insert_model(Model::new("m1", ModelVersion::new(1, spec(1))));

        let scheduler = SimpleScheduler::new(store.clone());
        assert!(scheduler.schedule("m1").await.is_err());
        assert!(scheduler.schedule_failed_models().await.unwrap().is_empty());

        register_replicas(&store, "serverA", 1).await;
        let scheduled = scheduler.schedule_failed_models().await.unwrap();
        assert_eq!(scheduled, vec!["m1".to_string()]);
        assert!(store.placement_failed_models().is_empty());
    }

    #[tokio::test]
    async fn schedule_requests_unloads_beyond_desired() {
        let store = Arc::new(InMemoryModelStore::new());
        register_replicas(&store, "serverA", 3).await;
        store.insert_model(Model::new(
            "m1",
            ModelVersion::new(1, spec(1))
                .with_server("serverA")
                .with_replica_state(0, ModelReplicaState::Loaded)
                .with_replica_state(1, ModelReplicaState::Loaded)
                .with_replica_state(2, ModelReplicaState::Loaded),
        ));

        let scheduler = SimpleScheduler::new(store.clone());
        scheduler.schedule("m1").await.unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        let latest = model.latest().unwrap();
        // The two highest replica indices are shed first.
        assert_eq!(
            latest.replicas_in_state(ModelReplicaState::UnloadRequested),
            vec![1, 2]
        );
        assert_eq!(
            latest.replicas_in_state(ModelReplicaState::Loaded),
            vec![0]
        );
    }

    #[tokio::test]
    async fn bound_version_stays_on_its_server() {
        let store = Arc::new(InMemoryModelStore::new());
        register_replicas(&store, "serverA", 1).await;
        register_replicas(&store, "serverB", 4).await;
        store.insert_model(Model::new(
            "m1",
            ModelVersion::new(1, spec(1)).with_server("serverA"),
        ));

        let scheduler = SimpleScheduler::new(store.clone());
        scheduler.schedule("m1").await.unwrap();

        let model = store.get_model("m1").await.unwrap().unwrap();
        assert_eq!(model.latest().unwrap().server.as_deref(), Some("serverA"));
    }
}
