//! Bamel CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Bamel controllers:
//! - `BareMetalNode` (`bamel.dev/v1`): one physical machine and its power lifecycle
//! - `BamelAutoscaler` (`bamel.dev/v1alpha1`): scaling policy for a pool of machines

pub mod bare_metal_node;
pub mod autoscaler;
pub mod quantity;

pub use bare_metal_node::*;
pub use autoscaler::*;
pub use quantity::*;

/// API group shared by all Bamel resources.
pub const API_GROUP: &str = "bamel.dev";

/// Annotation holding the RFC 3339 time of the last explicit reset request.
///
/// A node in `error` returns to `off` once this timestamp is newer than
/// the node's `stateSince`.
pub const RESET_ANNOTATION: &str = "bamel.dev/reset-requested-at";

/// Label placed on runtime `Node` objects whose name differs from the
/// `BareMetalNode` they run on.
pub const MACHINE_LABEL: &str = "bamel.dev/baremetal-node";
