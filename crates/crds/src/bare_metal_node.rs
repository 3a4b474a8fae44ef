//! BareMetalNode CRD
//!
//! One physical machine managed through its BMC. `spec` is desired state
//! (authored by operators and the pool autoscaler); the status is observed
//! state and is written only by the node state machine.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::quantity::{QuantityError, ResourceAmounts, parse_quantity};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "bamel.dev",
    version = "v1",
    kind = "BareMetalNode",
    shortname = "bmn",
    status = "BareMetalNodeStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.pool"}"#,
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.powerState"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Power","type":"string","jsonPath":".status.powerState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.nodeReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalNodeSpec {
    /// BMC address (IP, host, or URL for Redfish)
    pub mgmt_address: String,

    /// Primary NIC MAC address
    pub mac_address: String,

    /// Power-control mechanism
    pub power_interface: PowerInterface,

    /// Name of the Secret holding BMC credentials
    #[serde(default)]
    pub bmc_credentials: String,

    /// PXE boot configuration reference
    #[serde(default)]
    pub boot_profile: String,

    /// Physical rack (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack: Option<String>,

    /// Pool membership (general, gpu, storage, compute, ...)
    pub pool: String,

    /// Hardware capacity
    #[serde(default)]
    pub resources: ResourceCapacity,

    /// Desired power state, set by the pool autoscaler or an operator
    #[serde(default)]
    pub power_state: DesiredPowerState,

    /// External inventory identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
}

/// Hardware capacity as free-form Kubernetes quantity strings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapacity {
    #[serde(default)]
    pub cpu_capacity: String,

    #[serde(default)]
    pub memory_capacity: String,

    #[serde(default)]
    pub disk_capacity: String,

    /// CUDA cores (NVIDIA) or stream processors (AMD)
    #[serde(default)]
    pub gpu_capacity: String,
}

impl ResourceCapacity {
    /// Schedulable amounts (CPU and memory) of this machine.
    ///
    /// Empty fields count as zero.
    pub fn amounts(&self) -> Result<ResourceAmounts, QuantityError> {
        Ok(ResourceAmounts {
            cpu_millis: quantity_or_zero(&self.cpu_capacity, 1000.0)?,
            memory_bytes: quantity_or_zero(&self.memory_capacity, 1.0)?,
        })
    }
}

#[allow(clippy::cast_possible_truncation, reason = "capacities fit comfortably in i64")]
fn quantity_or_zero(raw: &str, scale: f64) -> Result<i64, QuantityError> {
    if raw.trim().is_empty() {
        return Ok(0);
    }
    Ok((parse_quantity(raw)? * scale).round() as i64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PowerInterface {
    Redfish,
    Ipmi,
    Wol,
}

impl std::fmt::Display for PowerInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Redfish => "redfish",
            Self::Ipmi => "ipmi",
            Self::Wol => "wol",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredPowerState {
    On,
    #[default]
    Off,
}

impl std::fmt::Display for DesiredPowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalNodeStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: NodeState,

    /// Time of the last state transition
    #[serde(default)]
    pub state_since: Option<DateTime<Utc>>,

    /// Last error message
    #[serde(default)]
    pub last_error: Option<String>,

    /// Observed power state
    #[serde(default)]
    pub power_state: ObservedPowerState,

    /// Last power command issued to the BMC
    #[serde(default)]
    pub last_power_action: Option<PowerAction>,

    #[serde(default)]
    pub power_action_time: Option<DateTime<Utc>>,

    /// Name of the corresponding runtime Node once joined
    #[serde(default)]
    pub kubernetes_node: Option<String>,

    #[serde(default)]
    pub node_ready: bool,

    #[serde(default)]
    pub bmc_reachable: bool,

    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub join_time: Option<DateTime<Utc>>,

    /// Spec generation this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Node lifecycle state.
///
/// Allowed edges: `off → powering-on → ready → draining → off`,
/// any state `→ error`, and `error → off` after a reset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    #[default]
    Off,
    PoweringOn,
    Ready,
    Draining,
    Error,
}

impl NodeState {
    /// All lifecycle states, in lifecycle order.
    pub const ALL: [NodeState; 5] = [
        NodeState::Off,
        NodeState::PoweringOn,
        NodeState::Ready,
        NodeState::Draining,
        NodeState::Error,
    ];

    /// Whether `self → next` is an edge of the lifecycle graph.
    ///
    /// Staying in the same state is not a transition and returns `false`.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Off, NodeState::PoweringOn)
                | (NodeState::PoweringOn, NodeState::Ready)
                | (NodeState::Ready, NodeState::Draining)
                | (NodeState::Draining, NodeState::Off)
                | (NodeState::Error, NodeState::Off)
                | (NodeState::Off | NodeState::PoweringOn | NodeState::Ready | NodeState::Draining, NodeState::Error)
        )
    }

    /// Mid-transition states that no scaling action may target.
    pub fn is_transitioning(self) -> bool {
        matches!(self, NodeState::PoweringOn | NodeState::Draining)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Off => "off",
            NodeState::PoweringOn => "powering-on",
            NodeState::Ready => "ready",
            NodeState::Draining => "draining",
            NodeState::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObservedPowerState {
    On,
    Off,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
}

impl BareMetalNode {
    /// Lifecycle state, treating a missing status as `off`.
    pub fn state(&self) -> NodeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Time of the last explicit reset request, if the annotation is present and valid.
    pub fn reset_requested_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .annotations
            .as_ref()?
            .get(crate::RESET_ANNOTATION)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}
