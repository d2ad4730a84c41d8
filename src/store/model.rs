//! Data model for the desired-state model store
//!
//! A [`Model`] is an ordered list of [`ModelVersion`]s. Only the latest
//! version is ever loaded onto new replicas; older versions linger during
//! rollout until their replicas are unloaded. Each version is bound to one
//! server and tracks per-replica state with the timestamp of the last
//! change, which feeds the autoscaling cooling-off check.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// State of one model instance on one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelReplicaState {
    /// The scheduler placed the model here; no command sent yet.
    LoadRequested,
    /// A LOAD_MODEL command is in flight to the replica.
    Loading,
    /// The replica confirmed the load.
    Loaded,
    /// The replica reported a load failure.
    LoadFailed,
    /// The scheduler wants the instance gone; no command sent yet.
    UnloadRequested,
    /// An UNLOAD_MODEL command is in flight to the replica.
    Unloading,
    /// The replica confirmed the unload.
    Unloaded,
    /// The replica reported an unload failure.
    UnloadFailed,
    /// State could not be derived from the agent event.
    Unknown,
}

impl ModelReplicaState {
    /// Whether the replica counts toward the version's active assignment.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ModelReplicaState::LoadRequested
                | ModelReplicaState::Loading
                | ModelReplicaState::Loaded
        )
    }
}

impl fmt::Display for ModelReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelReplicaState::LoadRequested => "LoadRequested",
            ModelReplicaState::Loading => "Loading",
            ModelReplicaState::Loaded => "Loaded",
            ModelReplicaState::LoadFailed => "LoadFailed",
            ModelReplicaState::UnloadRequested => "UnloadRequested",
            ModelReplicaState::Unloading => "Unloading",
            ModelReplicaState::Unloaded => "Unloaded",
            ModelReplicaState::UnloadFailed => "UnloadFailed",
            ModelReplicaState::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Per-replica status entry within a model version.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    /// Current replica state.
    pub state: ModelReplicaState,
    /// Free-form detail, e.g. the failure reason reported by the agent.
    pub reason: String,
    /// When the state last changed.
    pub timestamp: DateTime<Utc>,
}

impl ReplicaStatus {
    /// Create a status entry in the given state, stamped now.
    pub fn new(state: ModelReplicaState) -> Self {
        Self {
            state,
            reason: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Deployment parameters carried by a model version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentSpec {
    /// Desired replica count.
    pub replicas: u32,
    /// Lower autoscaling bound; 0 means unset.
    pub min_replicas: u32,
    /// Upper autoscaling bound; 0 means unset.
    pub max_replicas: u32,
    /// Memory one instance requires, in bytes.
    pub memory_bytes: u64,
}

/// A full model definition as submitted to the store.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Model name.
    pub name: String,
    /// Deployment parameters.
    pub deployment: DeploymentSpec,
}

/// One immutable version of a model, bound to a single server.
#[derive(Debug, Clone)]
pub struct ModelVersion {
    /// Version number; higher is newer.
    pub version: u32,
    /// Server this version's replicas live on. Unset until placed.
    pub server: Option<String>,
    /// Replica index to status.
    pub replicas: HashMap<u32, ReplicaStatus>,
    /// When any replica of this version last changed state.
    pub last_change: DateTime<Utc>,
    /// Deployment parameters for this version.
    pub spec: DeploymentSpec,
}

impl ModelVersion {
    /// Create a fresh version with no replica assignments.
    pub fn new(version: u32, spec: DeploymentSpec) -> Self {
        Self {
            version,
            server: None,
            replicas: HashMap::new(),
            last_change: Utc::now(),
            spec,
        }
    }

    /// Bind the version to a server.
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Override the last-change timestamp (e.g. to seed stability).
    pub fn with_last_change(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_change = timestamp;
        self
    }

    /// Put one replica into the given state.
    pub fn with_replica_state(mut self, replica_idx: u32, state: ModelReplicaState) -> Self {
        self.replicas.insert(replica_idx, ReplicaStatus::new(state));
        self
    }

    /// Replica indices currently in `state`, in ascending order.
    pub fn replicas_in_state(&self, state: ModelReplicaState) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .replicas
            .iter()
            .filter(|(_, status)| status.state == state)
            .map(|(idx, _)| *idx)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Replica indices assigned to this version (requested, loading or
    /// loaded), in ascending order.
    pub fn assignment(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .replicas
            .iter()
            .filter(|(_, status)| status.state.is_active())
            .map(|(idx, _)| *idx)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Whether at least one replica has confirmed a load.
    pub fn has_loaded_replica(&self) -> bool {
        self.replicas
            .values()
            .any(|status| status.state == ModelReplicaState::Loaded)
    }
}

/// A named model with its retained versions, oldest first.
#[derive(Debug, Clone)]
pub struct Model {
    /// Model name.
    pub name: String,
    /// Retained versions in ascending version order.
    pub versions: Vec<ModelVersion>,
}

impl Model {
    /// Create a model with a single version.
    pub fn new(name: impl Into<String>, version: ModelVersion) -> Self {
        Self {
            name: name.into(),
            versions: vec![version],
        }
    }

    /// Append a newer version.
    pub fn with_version(mut self, version: ModelVersion) -> Self {
        self.versions.push(version);
        self
    }

    /// The current target for new loads.
    pub fn latest(&self) -> Option<&ModelVersion> {
        self.versions.last()
    }

    /// Mutable access to the latest version.
    pub fn latest_mut(&mut self) -> Option<&mut ModelVersion> {
        self.versions.last_mut()
    }

    /// The highest version with at least one loaded replica; the basis for
    /// autoscaling decisions.
    pub fn last_available(&self) -> Option<&ModelVersion> {
        self.versions
            .iter()
            .rev()
            .find(|version| version.has_loaded_replica())
    }

    /// Look up a specific version.
    pub fn version(&self, version: u32) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Registration record for one server replica, taken from its subscribe
/// request.
#[derive(Debug, Clone)]
pub struct ServerReplica {
    /// Inference server name.
    pub server_name: String,
    /// Replica index within the server.
    pub replica_idx: u32,
    /// Memory advertised for model instances, in bytes.
    pub memory_bytes: u64,
    /// Maximum concurrent models the replica will host.
    pub capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spec(replicas: u32) -> DeploymentSpec {
        DeploymentSpec {
            replicas,
            ..Default::default()
        }
    }

    #[test]
    fn latest_is_the_highest_version() {
        let model = Model::new("m1", ModelVersion::new(1, spec(1)))
            .with_version(ModelVersion::new(2, spec(1)))
            .with_version(ModelVersion::new(3, spec(1)));

        assert_eq!(model.latest().unwrap().version, 3);
    }

    #[test]
    fn last_available_requires_a_loaded_replica() {
        let model = Model::new(
            "m1",
            ModelVersion::new(1, spec(1)).with_replica_state(0, ModelReplicaState::Loaded),
        )
        .with_version(
            ModelVersion::new(2, spec(1)).with_replica_state(1, ModelReplicaState::Loading),
        );

        // Version 2 has no loaded replica yet, so version 1 is still the
        // scaling basis.
        assert_eq!(model.last_available().unwrap().version, 1);
    }

    #[test]
    fn last_available_is_none_without_loads() {
        let model = Model::new(
            "m1",
            ModelVersion::new(1, spec(1)).with_replica_state(0, ModelReplicaState::LoadRequested),
        );
        assert!(model.last_available().is_none());
    }

    #[test]
    fn replicas_in_state_is_sorted() {
        let version = ModelVersion::new(1, spec(3))
            .with_replica_state(2, ModelReplicaState::LoadRequested)
            .with_replica_state(0, ModelReplicaState::LoadRequested)
            .with_replica_state(1, ModelReplicaState::Loaded);

        assert_eq!(
            version.replicas_in_state(ModelReplicaState::LoadRequested),
            vec![0, 2]
        );
    }

    #[test]
    fn assignment_excludes_unloading_replicas() {
        let version = ModelVersion::new(1, spec(3))
            .with_replica_state(0, ModelReplicaState::Loaded)
            .with_replica_state(1, ModelReplicaState::Loading)
            .with_replica_state(2, ModelReplicaState::UnloadRequested)
            .with_replica_state(3, ModelReplicaState::Unloaded);

        assert_eq!(version.assignment(), vec![0, 1]);
    }

    #[test]
    fn with_last_change_overrides_the_stamp() {
        let past = Utc::now() - Duration::seconds(600);
        let version = ModelVersion::new(1, spec(1)).with_last_change(past);
        assert_eq!(version.last_change, past);
    }
}
