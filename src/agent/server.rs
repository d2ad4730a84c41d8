//! gRPC server for the agent-facing control plane
//!
//! Owns the coordination engine that couples three concurrent sources of
//! change - operator intent (store events), agent reality (status events)
//! and agent telemetry (scaling triggers) - under per-model ordering and
//! per-stream send serialization:
//!
//! - `Subscribe` registers the replica, admits it to the store, retries
//!   previously failed placements, and on disconnect removes the replica
//!   and reschedules every model that lost capacity.
//! - `sync` (driven by store events through the event hub) emits LOAD
//!   commands for the latest version and UNLOAD commands across all
//!   versions, advancing replica states as commands go out.
//! - `AgentEvent` maps replica status reports onto expected-to-desired
//!   state transitions in the store.
//! - `ModelScalingTrigger` validates autoscaling triggers against the
//!   last-available, stable version and the configured bounds, then
//!   updates the store and re-invokes the placement scheduler.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::events::EventHub;
use crate::proto::agent_service_server::{AgentService, AgentServiceServer};
use crate::proto::model_operation_message::Operation;
use crate::proto::model_scaling_trigger_message::Trigger;
use crate::proto::{
    AgentSubscribeRequest, ModelEventMessage, ModelEventResponse, ModelOperationMessage,
    ModelScalingTriggerMessage, ModelScalingTriggerResponse, ModelVersionRef,
};
use crate::scheduler::Scheduler;
use crate::store::{DeploymentSpec, ModelReplicaState, ModelSpec, ModelStore, ModelVersion, ServerReplica};
use crate::{Error, Result};

use super::mtls::ServerMtlsConfig;
use super::registry::{AgentSubscriber, ReplicaKey, SubscriberRegistry};

const MODEL_EVENT_HANDLER_NAME: &str = "agent.server.models";
const PENDING_SYNC_QUEUE_SIZE: usize = 10;
const MODEL_SCALING_COOLING_OFF_SECONDS: i64 = 300;
const GRPC_MAX_CONCURRENT_STREAMS: u32 = 1_000_000;
const OUTBOUND_QUEUE_SIZE: usize = 32;

/// The agent-facing gRPC server.
///
/// Cheap to clone; all state lives behind one shared inner struct.
#[derive(Clone)]
pub struct AgentServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    registry: SubscriberRegistry,
    store: Arc<dyn ModelStore>,
    scheduler: Arc<dyn Scheduler>,
}

impl AgentServer {
    /// Create the server and register its model-event handler with the hub.
    ///
    /// Must be called from within a tokio runtime: the hub registration
    /// spawns the handler's drain task.
    pub fn new(store: Arc<dyn ModelStore>, scheduler: Arc<dyn Scheduler>, hub: &EventHub) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                registry: SubscriberRegistry::new(),
                store,
                scheduler,
            }),
        };

        let handler = server.clone();
        hub.register_model_event_handler(
            MODEL_EVENT_HANDLER_NAME,
            PENDING_SYNC_QUEUE_SIZE,
            move |event| {
                let server = handler.clone();
                tokio::spawn(async move {
                    server.sync(&event.model_name).await;
                });
            },
        );

        server
    }

    /// The registry of connected replica sessions.
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.inner.registry
    }

    /// Convert to a tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> AgentServiceServer<Self> {
        AgentServiceServer::new(self)
    }

    /// Open the configured listeners. At least one of plaintext or mTLS
    /// must be enabled.
    pub async fn start(
        &self,
        allow_plaintext: bool,
        port: u16,
        tls_port: u16,
        tls: Option<ServerMtlsConfig>,
    ) -> Result<()> {
        if !allow_plaintext && tls.is_none() {
            return Err(Error::config(
                "one of plaintext or mTLS must be enabled, \
                 but plaintext is disabled and no TLS material is configured",
            ));
        }
        if allow_plaintext {
            self.start_listener(port, None).await?;
        } else {
            info!("not starting plaintext agent listener");
        }
        if let Some(tls) = tls {
            self.start_listener(tls_port, Some(tls)).await?;
        } else {
            info!("not starting mTLS agent listener");
        }
        Ok(())
    }

    async fn start_listener(&self, port: u16, tls: Option<ServerMtlsConfig>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("binding {addr}: {e}")))?;

        let secure = tls.is_some();
        let mut builder = Server::builder().max_concurrent_streams(GRPC_MAX_CONCURRENT_STREAMS);
        if let Some(tls) = tls {
            builder = builder
                .tls_config(tls.to_tonic_config())
                .map_err(|e| Error::config(format!("invalid TLS material: {e}")))?;
        }

        info!(port, mtls = secure, "agent server listening");
        let service = self.clone().into_service();
        tokio::spawn(async move {
            if let Err(err) = builder
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
            {
                error!(port, mtls = secure, error = %err, "agent server failed");
            }
        });
        Ok(())
    }

    /// One reconcile pass for a model: emit LOAD commands for the latest
    /// version and UNLOAD commands across all versions, advancing replica
    /// states as commands go out.
    ///
    /// Never fails upward: every failure is per-replica, logged and
    /// skipped. A later model event re-enters from whatever the store then
    /// records. Passes for the same model serialize on the store's
    /// per-model lock.
    pub async fn sync(&self, model_name: &str) {
        let _lock = self.inner.store.lock_model(model_name).await;

        let model = match self.inner.store.get_model(model_name).await {
            Ok(Some(model)) => model,
            Ok(None) => {
                error!(model = %model_name, "model not found");
                return;
            }
            Err(err) => {
                error!(model = %model_name, error = %err, "sync failed");
                return;
            }
        };

        // Load pass, latest version only: older versions must never be
        // revived. They are either already loaded or stale.
        if let Some(latest) = model.latest() {
            if let Some(server) = latest.server.as_deref() {
                for replica_idx in latest.replicas_in_state(ModelReplicaState::LoadRequested) {
                    self.emit_operation(
                        model_name,
                        latest.version,
                        server,
                        replica_idx,
                        Operation::LoadModel,
                    )
                    .await;
                }
            }
        }

        // Unload pass across all versions: any version may still carry
        // replicas that must be shed.
        for version in &model.versions {
            let Some(server) = version.server.as_deref() else {
                continue;
            };
            for replica_idx in version.replicas_in_state(ModelReplicaState::UnloadRequested) {
                self.emit_operation(
                    model_name,
                    version.version,
                    server,
                    replica_idx,
                    Operation::UnloadModel,
                )
                .await;
            }
        }
    }

    /// Send one LOAD/UNLOAD command and advance the replica's state on
    /// success. Transport and store failures are logged and skipped; the
    /// store is never rolled back for a failed send.
    async fn emit_operation(
        &self,
        model_name: &str,
        version: u32,
        server: &str,
        replica_idx: u32,
        operation: Operation,
    ) {
        let key = ReplicaKey::new(server, replica_idx);
        let (expected, next) = match operation {
            Operation::LoadModel => (ModelReplicaState::LoadRequested, ModelReplicaState::Loading),
            Operation::UnloadModel => {
                (ModelReplicaState::UnloadRequested, ModelReplicaState::Unloading)
            }
            Operation::UnknownOperation => return,
        };
        info!(
            model = %model_name,
            version,
            replica = %key,
            operation = ?operation,
            "sending model operation"
        );

        let message = ModelOperationMessage {
            operation: operation.into(),
            model_version: Some(ModelVersionRef {
                model: model_name.to_string(),
                version,
            }),
        };
        match self.inner.registry.send(&key, message).await {
            Err(Error::NotFound(_)) => {
                error!(replica = %key, "failed to find server replica");
                return;
            }
            Err(err) => {
                error!(
                    model = %model_name,
                    replica = %key,
                    error = %err,
                    "stream message send failed"
                );
                return;
            }
            Ok(()) => {}
        }

        if let Err(err) = self
            .inner
            .store
            .update_model_state(model_name, version, server, replica_idx, None, expected, next, "")
            .await
        {
            error!(
                model = %model_name,
                replica = %key,
                error = %err,
                "failed to advance replica state"
            );
        }
    }

    /// Apply one autoscaling trigger against the current store state.
    async fn apply_model_scaling(&self, message: &ModelScalingTriggerMessage) -> Result<()> {
        let model_name = &message.model_name;
        let model = self
            .inner
            .store
            .get_model(model_name)
            .await?
            .ok_or_else(|| Error::not_found(format!("model {model_name} not found")))?;

        let last_available = model
            .last_available()
            .ok_or_else(|| Error::not_found(format!("no available version of model {model_name}")))?;

        if last_available.version != message.model_version {
            return Err(Error::version_mismatch(format!(
                "model {model_name} last available version is {}, trigger names {}",
                last_available.version, message.model_version
            )));
        }
        if !is_model_stable(last_available) {
            return Err(Error::unstable(format!(
                "model {model_name} changed state recently, skip scaling"
            )));
        }

        let current = last_available.assignment().len() as u32;
        let target = desired_replica_count(&last_available.spec, message.trigger(), current)?;

        let mut deployment = last_available.spec.clone();
        deployment.replicas = target;
        self.inner
            .store
            .update_model(ModelSpec {
                name: model_name.clone(),
                deployment,
            })
            .await?;
        self.inner.scheduler.schedule(model_name).await
    }
}

/// A model version is stable when its last state change predates the
/// cooling-off window. Scaling during rollout would thrash.
fn is_model_stable(version: &ModelVersion) -> bool {
    version.last_change < Utc::now() - chrono::Duration::seconds(MODEL_SCALING_COOLING_OFF_SECONDS)
}

/// Compute the replica target for a trigger, validating the bounds.
fn desired_replica_count(spec: &DeploymentSpec, trigger: Trigger, current: u32) -> Result<u32> {
    let target = match trigger {
        Trigger::ScaleUp => current + 1,
        Trigger::ScaleDown => current.saturating_sub(1),
        Trigger::UnknownTrigger => {
            return Err(Error::UnsupportedTrigger(format!(
                "trigger {trigger:?} not supported"
            )))
        }
    };
    check_scaling_within_range(spec, target)?;
    Ok(target)
}

/// Autoscaling is active only when at least one bound is set, and the
/// target must stay within the configured range and above zero.
fn check_scaling_within_range(spec: &DeploymentSpec, target: u32) -> Result<()> {
    if spec.min_replicas == 0 && spec.max_replicas == 0 {
        return Err(Error::AutoscalingDisabled(
            "neither min nor max replicas is set".to_string(),
        ));
    }
    if target < spec.min_replicas || target < 1 {
        return Err(Error::MinReplicasViolation(format!(
            "target {target} below minimum {}",
            spec.min_replicas.max(1)
        )));
    }
    if spec.max_replicas > 0 && target > spec.max_replicas {
        return Err(Error::MaxReplicasViolation(format!(
            "target {target} above maximum {}",
            spec.max_replicas
        )));
    }
    Ok(())
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    type SubscribeStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ModelOperationMessage, Status>> + Send + 'static>>;

    async fn subscribe(
        &self,
        request: Request<AgentSubscribeRequest>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let key = ReplicaKey::new(req.server_name.clone(), req.replica_idx);
        info!(replica = %key, "received subscribe request");

        let (tx, rx) = mpsc::channel::<ModelOperationMessage>(OUTBOUND_QUEUE_SIZE);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let subscriber = Arc::new(AgentSubscriber::new(tx.clone(), done_tx));
        self.inner.registry.add(key.clone(), subscriber.clone());

        // Admit the replica and retry any placements that previously failed
        // for lack of capacity. Failure here refuses the subscription.
        let config = req.replica_config.unwrap_or_default();
        let admission = async {
            self.inner
                .store
                .add_server_replica(ServerReplica {
                    server_name: req.server_name.clone(),
                    replica_idx: req.replica_idx,
                    memory_bytes: config.memory_bytes,
                    capacity: config.capacity,
                })
                .await?;
            self.inner.scheduler.schedule_failed_models().await?;
            Ok::<(), Error>(())
        };
        if let Err(err) = admission.await {
            self.inner.registry.remove_if(&key, &subscriber);
            error!(replica = %key, error = %err, "failed to admit replica");
            return Err(Status::internal(err.to_string()));
        }

        // The transport keeps the stream open as long as the receiver
        // lives; this task watches for either termination trigger.
        let server = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done_rx.recv() => {
                    info!(replica = %key, "closing stream for replica");
                    server.inner.registry.remove_if(&key, &subscriber);
                }
                _ = tx.closed() => {
                    info!(replica = %key, "replica disconnected");
                    server.inner.registry.remove_if(&key, &subscriber);
                    match server
                        .inner
                        .store
                        .remove_server_replica(&key.server_name, key.replica_idx)
                        .await
                    {
                        Ok(changed) => {
                            debug!(replica = %key, models = ?changed, "models disturbed by disconnect");
                            for model_name in changed {
                                if let Err(err) = server.inner.scheduler.schedule(&model_name).await {
                                    debug!(
                                        model = %model_name,
                                        replica = %key,
                                        error = %err,
                                        "failed to reschedule model after disconnect"
                                    );
                                }
                            }
                        }
                        Err(err) => {
                            error!(
                                replica = %key,
                                error = %err,
                                "failed to remove replica after disconnect"
                            );
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx).map(Ok))))
    }

    async fn agent_event(
        &self,
        request: Request<ModelEventMessage>,
    ) -> std::result::Result<Response<ModelEventResponse>, Status> {
        use crate::proto::model_event_message::Event;

        let message = request.into_inner();
        let (expected, desired) = match message.event() {
            Event::Loaded => (ModelReplicaState::Loading, ModelReplicaState::Loaded),
            Event::Unloaded => (ModelReplicaState::Unloading, ModelReplicaState::Unloaded),
            Event::LoadFailed | Event::LoadFailMemory => {
                (ModelReplicaState::Loading, ModelReplicaState::LoadFailed)
            }
            Event::UnloadFailed => (ModelReplicaState::Unloading, ModelReplicaState::UnloadFailed),
            Event::UnknownEvent => (ModelReplicaState::Unknown, ModelReplicaState::Unknown),
        };
        info!(
            model = %message.model_name,
            version = message.model_version,
            state = %desired,
            "updating replica state"
        );

        let _lock = self.inner.store.lock_model(&message.model_name).await;
        if let Err(err) = self
            .inner
            .store
            .update_model_state(
                &message.model_name,
                message.model_version,
                &message.server_name,
                message.replica_idx,
                Some(message.available_memory_bytes),
                expected,
                desired,
                &message.message,
            )
            .await
        {
            info!(model = %message.model_name, error = %err, "failed to update replica state");
            return Err(Status::internal(err.to_string()));
        }
        Ok(Response::new(ModelEventResponse {}))
    }

    async fn model_scaling_trigger(
        &self,
        request: Request<Streaming<ModelScalingTriggerMessage>>,
    ) -> std::result::Result<Response<ModelScalingTriggerResponse>, Status> {
        let mut stream = request.into_inner();
        loop {
            match stream.message().await? {
                Some(message) => {
                    info!(
                        server = %message.server_name,
                        replica = message.replica_idx,
                        model = %message.model_name,
                        version = message.model_version,
                        "received scaling trigger"
                    );
                    // Applied independently against current store state;
                    // ordering between triggers is deliberately unspecified.
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.apply_model_scaling(&message).await {
                            debug!(
                                model = %message.model_name,
                                error = %err,
                                "could not scale model"
                            );
                        }
                    });
                }
                None => return Ok(Response::new(ModelScalingTriggerResponse {})),
            }
        }
    }
}
