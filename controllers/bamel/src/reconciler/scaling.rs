//! Pool scaling arithmetic.
//!
//! Pure functions over a pool snapshot: no I/O, no clock. The autoscaler
//! loop feeds them the index snapshot and per-node allocated resources and
//! applies whatever decision comes back.

use crate::error::ControllerError;
use crate::pool_index::{NodeEntry, PoolSnapshot};
use crds::{BamelAutoscalerSpec, DesiredPowerState, NodeState, ResourceAmounts, ScaleInPreference, ScaleOutPreference};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// A validated BamelAutoscaler spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub pool: String,
    pub min_ready: u32,
    pub max_nodes: Option<u32>,
    pub target_cpu_percent: Option<u32>,
    pub hysteresis_margin: u32,
    pub max_concurrent_power_on: u32,
    pub max_concurrent_drain: u32,
    pub scale_out: ScaleOutPreference,
    pub scale_in: ScaleInPreference,
    pub recover_errored: bool,
}

impl ScalingPolicy {
    pub fn from_spec(spec: &BamelAutoscalerSpec) -> Result<Self, ControllerError> {
        if spec.pool.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("pool must not be empty".to_string()));
        }
        if let Some(max) = spec.max_nodes
            && spec.min_ready > max
        {
            return Err(ControllerError::InvalidConfig(format!(
                "minReady ({}) exceeds maxNodes ({max})",
                spec.min_ready
            )));
        }
        if let Some(percent) = spec.target_cpu_utilization_percent
            && !(1..=100).contains(&percent)
        {
            return Err(ControllerError::InvalidConfig(format!(
                "targetCpuUtilizationPercent must be within 1..=100, got {percent}"
            )));
        }
        Ok(Self {
            pool: spec.pool.clone(),
            min_ready: spec.min_ready,
            max_nodes: spec.max_nodes,
            target_cpu_percent: spec.target_cpu_utilization_percent,
            hysteresis_margin: spec.hysteresis_margin,
            max_concurrent_power_on: spec.max_concurrent_power_on,
            max_concurrent_drain: spec.max_concurrent_drain,
            scale_out: spec.scale_out_preference,
            scale_in: spec.scale_in_preference,
            recover_errored: spec.recover_errored_nodes,
        })
    }

    /// Whether evaluation needs per-node allocated resources.
    pub fn needs_load(&self) -> bool {
        self.target_cpu_percent.is_some() || self.scale_in == ScaleInPreference::LeastFreeCapacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    ScaleOut,
    ScaleIn,
}

impl ScaleDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleDirection::ScaleOut => "scale-out",
            ScaleDirection::ScaleIn => "scale-in",
        }
    }

    /// Desired power state the decision writes to its candidates.
    pub fn desired_power(self) -> DesiredPowerState {
        match self {
            ScaleDirection::ScaleOut => DesiredPowerState::On,
            ScaleDirection::ScaleIn => DesiredPowerState::Off,
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the autoscaler should change in one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingDecision {
    pub pool: String,
    pub direction: ScaleDirection,
    /// Signed node count change: positive powers on, negative drains
    pub delta: i32,
    /// Nodes to patch, in preference order
    pub candidates: Vec<String>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Ready nodes still wanted
    pub ready: u32,
    /// Nodes commanded on but not ready yet
    pub pending: u32,
    /// `ready + pending`
    pub supply: u32,
    pub target: u32,
    /// Nodes the evaluation wanted to move but found no candidate for
    pub unmet: u32,
    pub decision: Option<ScalingDecision>,
}

fn count(nodes: &[NodeEntry], predicate: impl Fn(&NodeEntry) -> bool) -> u32 {
    u32::try_from(nodes.iter().filter(|n| predicate(n)).count()).unwrap_or(u32::MAX)
}

/// Ready count needed to keep CPU utilization at `percent`.
fn utilization_target(active: &[&NodeEntry], load: &HashMap<String, ResourceAmounts>, percent: u32) -> Option<u32> {
    if active.is_empty() || percent == 0 {
        return None;
    }
    let allocated: i64 = active
        .iter()
        .map(|n| load.get(&n.name).map_or(0, |a| a.cpu_millis))
        .sum();
    let capacity: i64 = active.iter().map(|n| n.capacity.cpu_millis).sum();
    let allocated = u128::try_from(allocated).unwrap_or(0);
    let capacity = u128::try_from(capacity).unwrap_or(0);
    if capacity == 0 {
        return None;
    }
    // ceil(allocated / (capacity / n * percent / 100)) without floating point
    let nodes = active.len() as u128;
    let needed = (allocated * nodes * 100).div_ceil(capacity * u128::from(percent));
    Some(u32::try_from(needed).unwrap_or(u32::MAX))
}

/// Target supply for the pool.
pub fn target(policy: &ScalingPolicy, snapshot: &PoolSnapshot, load: &HashMap<String, ResourceAmounts>) -> u32 {
    let active: Vec<&NodeEntry> = snapshot.nodes.iter().filter(|n| n.is_active()).collect();
    let mut target = policy.min_ready;
    if let Some(percent) = policy.target_cpu_percent
        && let Some(needed) = utilization_target(&active, load, percent)
    {
        target = target.max(needed);
    }
    match policy.max_nodes {
        Some(max) => target.min(max),
        None => target,
    }
}

/// Compare the pool against its policy and pick the nodes to move.
pub fn evaluate(policy: &ScalingPolicy, snapshot: &PoolSnapshot, load: &HashMap<String, ResourceAmounts>) -> Evaluation {
    let ready = count(&snapshot.nodes, NodeEntry::is_active);
    let pending = count(&snapshot.nodes, NodeEntry::is_pending);
    let supply = ready + pending;
    let target = target(policy, snapshot, load);

    let mut evaluation = Evaluation {
        ready,
        pending,
        supply,
        target,
        unmet: 0,
        decision: None,
    };

    // Caps bound nodes in flight, not nodes commanded per pass.
    let (direction, wanted, candidates) = if supply < target {
        let slots = policy.max_concurrent_power_on.saturating_sub(pending);
        let wanted = (target - supply).min(slots);
        (ScaleDirection::ScaleOut, wanted, scale_out_candidates(policy, snapshot, wanted))
    } else if supply - target > policy.hysteresis_margin {
        let slots = policy.max_concurrent_drain.saturating_sub(count(&snapshot.nodes, NodeEntry::is_leaving));
        let wanted = (supply - target).min(slots);
        (ScaleDirection::ScaleIn, wanted, scale_in_candidates(policy, snapshot, load, wanted))
    } else {
        return evaluation;
    };

    let found = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
    evaluation.unmet = wanted.saturating_sub(found);
    if !candidates.is_empty() {
        let magnitude = i32::try_from(found).unwrap_or(i32::MAX);
        evaluation.decision = Some(ScalingDecision {
            pool: snapshot.pool.clone(),
            direction,
            delta: match direction {
                ScaleDirection::ScaleOut => magnitude,
                ScaleDirection::ScaleIn => -magnitude,
            },
            candidates,
        });
    }
    evaluation
}

/// Whether `entry` may be powered on by a scale-out.
pub fn eligible_for_scale_out(policy: &ScalingPolicy, entry: &NodeEntry) -> bool {
    match entry.state {
        NodeState::Off => entry.desired == DesiredPowerState::Off,
        NodeState::Error => policy.recover_errored && !entry.reset_pending,
        NodeState::PoweringOn | NodeState::Ready | NodeState::Draining => false,
    }
}

fn scale_out_candidates(policy: &ScalingPolicy, snapshot: &PoolSnapshot, wanted: u32) -> Vec<String> {
    // Supply per rack; nodes without a rack never count toward a rack.
    let mut rack_load: HashMap<&str, u32> = HashMap::new();
    for entry in snapshot.nodes.iter().filter(|n| n.is_active() || n.is_pending()) {
        if let Some(rack) = entry.rack.as_deref() {
            *rack_load.entry(rack).or_default() += 1;
        }
    }

    let mut remaining: Vec<&NodeEntry> = snapshot
        .nodes
        .iter()
        .filter(|n| eligible_for_scale_out(policy, n))
        .collect();
    let mut picked = Vec::new();

    while picked.len() < wanted as usize && !remaining.is_empty() {
        let load_of = |entry: &NodeEntry| entry.rack.as_deref().map_or(0, |r| rack_load.get(r).copied().unwrap_or(0));
        let compare = |a: &NodeEntry, b: &NodeEntry| {
            let by_name = a.name.cmp(&b.name);
            match policy.scale_out {
                // Latest join first; never-joined nodes last.
                ScaleOutPreference::RecentlyReady => b
                    .join_time
                    .cmp(&a.join_time)
                    .then_with(|| load_of(a).cmp(&load_of(b)))
                    .then(by_name),
                ScaleOutPreference::RackSpread => load_of(a).cmp(&load_of(b)).then(by_name),
                ScaleOutPreference::Name => by_name,
            }
        };
        let best = (0..remaining.len()).min_by(|&i, &j| compare(remaining[i], remaining[j]));
        let Some(i) = best else { break };
        let entry = remaining.swap_remove(i);
        if let Some(rack) = entry.rack.as_deref() {
            *rack_load.entry(rack).or_default() += 1;
        }
        picked.push(entry.name.clone());
    }
    picked
}

fn free_capacity(entry: &NodeEntry, load: &HashMap<String, ResourceAmounts>) -> ResourceAmounts {
    entry
        .capacity
        .saturating_sub(load.get(&entry.name).copied().unwrap_or_default())
}

fn scale_in_candidates(
    policy: &ScalingPolicy,
    snapshot: &PoolSnapshot,
    load: &HashMap<String, ResourceAmounts>,
    wanted: u32,
) -> Vec<String> {
    let mut candidates: Vec<&NodeEntry> = snapshot.nodes.iter().filter(|n| n.is_active()).collect();
    candidates.sort_by(|a, b| {
        let order = match policy.scale_in {
            ScaleInPreference::LeastFreeCapacity => {
                let (fa, fb) = (free_capacity(a, load), free_capacity(b, load));
                fa.cpu_millis
                    .cmp(&fb.cpu_millis)
                    .then(fa.memory_bytes.cmp(&fb.memory_bytes))
            }
            // Unknown join times sort first.
            ScaleInPreference::OldestJoin => a.join_time.cmp(&b.join_time),
            ScaleInPreference::Name => Ordering::Equal,
        };
        order.then_with(|| a.name.cmp(&b.name))
    });
    candidates
        .into_iter()
        .take(wanted as usize)
        .map(|n| n.name.clone())
        .collect()
}
