//! Agent-facing control plane surface
//!
//! Inference server replicas ("agents") connect inbound to this surface
//! over gRPC and never the other way around.
//!
//! # Architecture
//!
//! ```text
//! Control Plane
//!   ├── AgentServer (gRPC)
//!   │   ├── Subscribe() → registers the replica, streams LOAD/UNLOAD
//!   │   ├── AgentEvent() → applies replica state transitions to the store
//!   │   └── ModelScalingTrigger() → applies autoscaling triggers
//!   └── SubscriberRegistry
//!       ├── (server, replica) → active stream + send lock
//!       └── at most one session per replica; duplicates replace
//!
//! Replica (agent)
//!   └── Subscribes once per process, acts on streamed commands,
//!       reports outcomes via AgentEvent
//! ```
//!
//! # Security Model
//!
//! Two listeners may run concurrently: plaintext and mutually-
//! authenticated TLS. TLS material comes from environment-variable-
//! prefixed paths resolved once at startup (see [`mtls`]).

pub mod mtls;
pub mod registry;
pub mod server;

pub use mtls::{SecurityProtocol, ServerMtlsConfig};
pub use registry::{AgentSubscriber, ReplicaKey, SharedSubscriberRegistry, SubscriberRegistry};
pub use server::AgentServer;
