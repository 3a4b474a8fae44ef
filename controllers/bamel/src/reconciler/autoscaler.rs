//! Pool autoscaler loop.
//!
//! One pass per pool: pick the owning BamelAutoscaler, evaluate the pool
//! snapshot against it, patch `spec.powerState` on the chosen nodes and
//! report what happened in the autoscaler's status.

use super::Reconciler;
use super::scaling::{self, Evaluation, ScaleDirection, ScalingDecision, ScalingPolicy};
use crate::error::ControllerError;
use crate::pool_index::{NodeEntry, PoolSnapshot};
use crate::scheduler::ReconcileAction;
use chrono::{DateTime, Utc};
use crds::{BamelAutoscaler, BamelAutoscalerStatus, NodeState, ResourceAmounts};
use kube::ResourceExt;
use std::collections::HashMap;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

fn fill_counts(status: &mut BamelAutoscalerStatus, snapshot: &PoolSnapshot) {
    let counts = snapshot.counts;
    status.observed_ready = counts.ready;
    status.pending = u32::try_from(snapshot.nodes.iter().filter(|n| n.is_pending()).count()).unwrap_or(u32::MAX);
    status.draining = counts.draining;
    status.off = counts.off;
    status.errored = counts.error;
}

impl Reconciler {
    /// Reconciles the pool named `pool`.
    pub async fn reconcile_pool(&self, pool: &str) -> Result<ReconcileAction, ControllerError> {
        let span = info_span!("reconcile_pool", pool = %pool, id = %Uuid::new_v4());
        self.reconcile_pool_inner(pool).instrument(span).await
    }

    async fn reconcile_pool_inner(&self, pool: &str) -> Result<ReconcileAction, ControllerError> {
        let snapshot = self.index.snapshot(pool);
        self.metrics.set_pool_counts(pool, &snapshot.counts);

        let mut policies: Vec<BamelAutoscaler> = self
            .backends
            .policies
            .list_policies()
            .await?
            .into_iter()
            .filter(|p| p.spec.pool == pool)
            .collect();
        policies.sort_by_key(ResourceExt::name_any);

        let Some((owner, duplicates)) = policies.split_first() else {
            debug!("No autoscaler governs this pool");
            return Ok(ReconcileAction::Done);
        };
        let now = Utc::now();

        for duplicate in duplicates {
            let mut status = duplicate.status.clone().unwrap_or_default();
            status.set_scaling_active(
                false,
                "DuplicatePool",
                &format!("pool {pool} is already governed by {}", owner.name_any()),
                now,
            );
            self.write_policy_status(duplicate, status).await?;
        }

        let status = self.evaluate_owner(owner, pool, &snapshot, now).await;
        self.write_policy_status(owner, status).await?;
        Ok(ReconcileAction::Requeue(self.config.autoscaler_interval))
    }

    async fn evaluate_owner(
        &self,
        owner: &BamelAutoscaler,
        pool: &str,
        snapshot: &PoolSnapshot,
        now: DateTime<Utc>,
    ) -> BamelAutoscalerStatus {
        let mut status = owner.status.clone().unwrap_or_default();
        fill_counts(&mut status, snapshot);

        let policy = match ScalingPolicy::from_spec(&owner.spec) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(autoscaler = %owner.name_any(), error = %e, "Invalid autoscaler");
                status.set_scaling_active(false, "InvalidPolicy", &e.to_string(), now);
                return status;
            }
        };
        if owner.spec.suspended {
            status.set_scaling_active(false, "Suspended", "scaling is suspended", now);
            return status;
        }

        let load = if policy.needs_load() {
            match self.pool_load(snapshot).await {
                Ok(load) => load,
                Err(e) => {
                    warn!(error = %e, "Could not read pool utilization");
                    status.set_scaling_active(false, "UtilizationUnavailable", &e.to_string(), now);
                    return status;
                }
            }
        } else {
            HashMap::new()
        };

        let evaluation = scaling::evaluate(&policy, snapshot, &load);
        status.desired_ready = evaluation.target;
        if evaluation.unmet > 0 {
            debug!(unmet = evaluation.unmet, "Not enough eligible nodes for a full step");
        }

        if let Some(decision) = &evaluation.decision {
            let applied = self.apply_decision(&policy, decision, now).await;
            if !applied.is_empty() {
                info!(
                    direction = %decision.direction,
                    nodes = ?applied,
                    supply = evaluation.supply,
                    target = evaluation.target,
                    "Scaling decision applied"
                );
                self.metrics
                    .scaling_decisions
                    .with_label_values(&[pool, decision.direction.as_str()])
                    .inc();
                status.last_scale_time = Some(now);
                status.last_decision = Some(format!("{} {}: {}", decision.direction, applied.len(), applied.join(", ")));
            }
            fill_counts(&mut status, &self.index.snapshot(pool));
        }

        status.set_scaling_active(true, "Evaluated", &summary(&evaluation), now);
        status
    }

    /// Allocated resources of every active node, keyed by BareMetalNode name.
    async fn pool_load(&self, snapshot: &PoolSnapshot) -> Result<HashMap<String, ResourceAmounts>, ControllerError> {
        let mut load = HashMap::new();
        for entry in snapshot.nodes.iter().filter(|n| n.is_active()) {
            let runtime_name = entry.kubernetes_node.as_deref().unwrap_or(&entry.name);
            let allocated = self.backends.runtime.allocated(runtime_name).await?;
            load.insert(entry.name.clone(), allocated);
        }
        Ok(load)
    }

    /// Patch desired power on each candidate; returns the nodes patched.
    ///
    /// Candidates are re-read first so a node that moved since the snapshot
    /// is skipped, and each patch carries that read's resourceVersion.
    async fn apply_decision(&self, policy: &ScalingPolicy, decision: &ScalingDecision, now: DateTime<Utc>) -> Vec<String> {
        let mut applied = Vec::new();
        for name in &decision.candidates {
            let node = match self.backends.nodes.get_node(name).await {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(e) => {
                    warn!(node = %name, error = %e, "Could not re-read scaling candidate");
                    continue;
                }
            };
            let Some(entry) = NodeEntry::from_node(&node) else {
                continue;
            };
            let still_eligible = match decision.direction {
                ScaleDirection::ScaleOut => scaling::eligible_for_scale_out(policy, &entry),
                ScaleDirection::ScaleIn => entry.is_active(),
            };
            if !still_eligible || entry.pool != decision.pool {
                debug!(node = %name, state = %entry.state, "Candidate no longer eligible");
                continue;
            }

            let reset = (entry.state == NodeState::Error).then_some(now);
            match self
                .backends
                .nodes
                .set_desired_power(&node, decision.direction.desired_power(), reset)
                .await
            {
                Ok(updated) => {
                    self.index.apply(&updated);
                    applied.push(name.clone());
                }
                Err(e) if e.is_conflict() => {
                    debug!(node = %name, "Node changed underneath the decision, skipping until next pass");
                }
                Err(e) => warn!(node = %name, error = %e, "Failed to patch desired power"),
            }
        }
        applied
    }

    async fn write_policy_status(
        &self,
        policy: &BamelAutoscaler,
        status: BamelAutoscalerStatus,
    ) -> Result<(), ControllerError> {
        if policy.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.backends.policies.update_policy_status(policy, &status).await
    }
}

fn summary(evaluation: &Evaluation) -> String {
    format!(
        "supply {} (ready {}, pending {}), target {}",
        evaluation.supply, evaluation.ready, evaluation.pending, evaluation.target
    )
}
