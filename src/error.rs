//! Error types for the control plane

use thiserror::Error;

/// Main error type for control-plane operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Model or model version not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Scaling trigger names a version other than the last available one
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// Model changed state within the cooling-off window
    #[error("model not stable: {0}")]
    Unstable(String),

    /// Neither min nor max replicas configured, so autoscaling is off
    #[error("autoscaling disabled: {0}")]
    AutoscalingDisabled(String),

    /// Scaling would drop below the configured minimum (or below one)
    #[error("min replicas violation: {0}")]
    MinReplicasViolation(String),

    /// Scaling would exceed the configured maximum
    #[error("max replicas violation: {0}")]
    MaxReplicasViolation(String),

    /// Scaling trigger other than SCALE_UP / SCALE_DOWN
    #[error("unsupported trigger: {0}")]
    UnsupportedTrigger(String),

    /// A per-replica stream rejected an outbound message
    #[error("transport error: {0}")]
    Transport(String),

    /// The model store rejected an operation
    #[error("store error: {0}")]
    Store(String),

    /// The placement scheduler could not satisfy a request
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// Invalid startup configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a version-mismatch error with the given message
    pub fn version_mismatch(msg: impl Into<String>) -> Self {
        Self::VersionMismatch(msg.into())
    }

    /// Create an unstable-model error with the given message
    pub fn unstable(msg: impl Into<String>) -> Self {
        Self::Unstable(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a scheduling error with the given message
    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
