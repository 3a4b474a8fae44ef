//! BamelAutoscaler CRD
//!
//! Scaling policy for one pool of BareMetalNodes. The autoscaler loop acts
//! on it by flipping `spec.powerState` on member nodes and records what it
//! saw in the status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "bamel.dev",
    version = "v1alpha1",
    kind = "BamelAutoscaler",
    shortname = "bas",
    status = "BamelAutoscalerStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.pool"}"#,
    printcolumn = r#"{"name":"MinReady","type":"integer","jsonPath":".spec.minReady"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.observedReady"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BamelAutoscalerSpec {
    /// Pool this policy governs
    pub pool: String,

    /// Minimum number of ready nodes
    pub min_ready: u32,

    /// Upper bound on ready plus pending nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,

    /// Target CPU utilization of ready nodes, in percent (1..=100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization_percent: Option<u32>,

    /// Surplus tolerated above the target before scaling in
    #[serde(default = "default_hysteresis_margin")]
    pub hysteresis_margin: u32,

    #[serde(default = "default_max_concurrent_power_on")]
    pub max_concurrent_power_on: u32,

    #[serde(default = "default_max_concurrent_drain")]
    pub max_concurrent_drain: u32,

    #[serde(default)]
    pub scale_out_preference: ScaleOutPreference,

    #[serde(default)]
    pub scale_in_preference: ScaleInPreference,

    /// Also power on nodes in `error`, stamping a reset request on them
    #[serde(default)]
    pub recover_errored_nodes: bool,

    /// Stop issuing decisions while keeping status up to date
    #[serde(default)]
    pub suspended: bool,
}

fn default_hysteresis_margin() -> u32 {
    1
}

fn default_max_concurrent_power_on() -> u32 {
    2
}

fn default_max_concurrent_drain() -> u32 {
    1
}

/// Ordering of scale-out candidates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ScaleOutPreference {
    /// Latest join time first, then least-loaded rack, then name
    #[default]
    RecentlyReady,
    /// Least-loaded rack first, then name
    RackSpread,
    Name,
}

/// Ordering of scale-in candidates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ScaleInPreference {
    /// Least free CPU, then least free memory, then name
    #[default]
    LeastFreeCapacity,
    OldestJoin,
    Name,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BamelAutoscalerStatus {
    #[serde(default)]
    pub observed_ready: u32,

    /// Powering-on nodes plus nodes commanded on but not yet picked up
    #[serde(default)]
    pub pending: u32,

    #[serde(default)]
    pub draining: u32,

    #[serde(default)]
    pub off: u32,

    #[serde(default)]
    pub errored: u32,

    /// Target ready count from the last evaluation
    #[serde(default)]
    pub desired_ready: u32,

    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,

    /// Human-readable summary of the last decision
    #[serde(default)]
    pub last_decision: Option<String>,

    #[serde(default)]
    pub conditions: Vec<PoolCondition>,
}

/// Condition type reported on every autoscaler.
pub const SCALING_ACTIVE: &str = "ScalingActive";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    pub reason: String,

    #[serde(default)]
    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

impl BamelAutoscalerStatus {
    /// The `ScalingActive` condition, if one has been recorded.
    pub fn scaling_active(&self) -> Option<&PoolCondition> {
        self.conditions.iter().find(|c| c.type_ == SCALING_ACTIVE)
    }

    /// Record the `ScalingActive` condition.
    ///
    /// `last_transition_time` only moves when the status flips; an identical
    /// condition leaves the status untouched.
    pub fn set_scaling_active(&mut self, active: bool, reason: &str, message: &str, now: DateTime<Utc>) {
        let status = if active { "True" } else { "False" };
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == SCALING_ACTIVE) {
            if existing.status != status {
                existing.last_transition_time = now;
                existing.status = status.to_string();
            }
            reason.clone_into(&mut existing.reason);
            message.clone_into(&mut existing.message);
            return;
        }
        self.conditions.push(PoolCondition {
            type_: SCALING_ACTIVE.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        });
    }
}
