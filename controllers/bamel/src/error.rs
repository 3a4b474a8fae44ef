//! Controller-specific error types.
//!
//! Errors from the Kubernetes API, the power drivers and the controller's
//! own invariants, folded into one enum the work queues understand.

use crds::NodeState;
use kube::Error as KubeError;
use power_driver::PowerError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the Bamel controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Power driver error
    #[error("Power driver error: {0}")]
    Power(#[from] PowerError),

    /// Optimistic concurrency conflict (stale resourceVersion)
    #[error("Conflict writing {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Status write that is not an edge of the lifecycle graph
    #[error("Invalid transition for {node}: {from} -> {to}")]
    InvalidTransition { node: String, from: NodeState, to: NodeState },

    /// Runtime cluster (Node/Pod) operation failed
    #[error("Runtime cluster error: {0}")]
    Runtime(String),

    /// BMC credentials could not be resolved
    #[error("Credential resolution failed: {0}")]
    Credentials(String),

    /// Reconciliation exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe server I/O error
    #[error("Probe server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ControllerError {
    /// Map a Kubernetes error, turning 409 and 404 into their dedicated variants.
    pub fn from_kube(err: KubeError, what: &str) -> Self {
        match &err {
            KubeError::Api(status) if status.code == 409 => ControllerError::Conflict(what.to_string()),
            KubeError::Api(status) if status.code == 404 => ControllerError::NotFound(what.to_string()),
            _ => ControllerError::Kube(err),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Conflict(_))
    }
}
