//! Prometheus metrics for the controller.

use crate::error::ControllerError;
use crate::pool_index::StateCounts;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Controller metrics, registered on a private registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Reconciliations by loop (`node`, `pool`) and result
    pub reconciliations: IntCounterVec,
    /// Lifecycle transitions by source and target state
    pub transitions: IntCounterVec,
    /// BMC calls by interface, operation and result
    pub driver_calls: IntCounterVec,
    /// Applied scaling decisions by pool and direction
    pub scaling_decisions: IntCounterVec,
    /// Nodes per pool and lifecycle state
    pub pool_nodes: IntGaugeVec,
    /// Keys waiting in each work queue
    pub queue_depth: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("bamel_reconciliations_total", "Reconciliations by loop and result"),
            &["loop", "result"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new("bamel_node_transitions_total", "BareMetalNode state transitions"),
            &["from", "to"],
        )?;
        let driver_calls = IntCounterVec::new(
            Opts::new("bamel_driver_calls_total", "Power driver calls by interface, operation and result"),
            &["interface", "operation", "result"],
        )?;
        let scaling_decisions = IntCounterVec::new(
            Opts::new("bamel_scaling_decisions_total", "Applied scaling decisions"),
            &["pool", "direction"],
        )?;
        let pool_nodes = IntGaugeVec::new(
            Opts::new("bamel_pool_nodes", "Nodes per pool and lifecycle state"),
            &["pool", "state"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("bamel_queue_depth", "Keys waiting in the work queue"),
            &["queue"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(driver_calls.clone()))?;
        registry.register(Box::new(scaling_decisions.clone()))?;
        registry.register(Box::new(pool_nodes.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            transitions,
            driver_calls,
            scaling_decisions,
            pool_nodes,
            queue_depth,
        })
    }

    /// Publish the per-state node counts of one pool.
    pub fn set_pool_counts(&self, pool: &str, counts: &StateCounts) {
        for (state, count) in counts.by_state() {
            self.pool_nodes
                .with_label_values(&[pool, state.as_str()])
                .set(i64::from(count));
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}
