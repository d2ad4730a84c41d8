//! gRPC protocol definitions for agent-control-plane communication
//!
//! This module contains the generated Protobuf and gRPC code for the
//! agent-facing service.
//!
//! # Protocol Overview
//!
//! Agents (embedded in inference server replicas) initiate outbound gRPC
//! connections to the control plane:
//!
//! - `Subscribe` opens the long-lived command stream; the control plane
//!   pushes `ModelOperationMessage` (LOAD_MODEL / UNLOAD_MODEL) down it.
//! - `AgentEvent` posts one `ModelEventMessage` per replica state change.
//! - `ModelScalingTrigger` streams `ModelScalingTriggerMessage` autoscaling
//!   triggers; the control plane acknowledges once at stream end.

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for the agent service
pub mod agent {
    /// Version 1 of the agent protocol
    pub mod v1 {
        tonic::include_proto!("corral.agent.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use agent::v1::*;
