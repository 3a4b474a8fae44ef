//! BareMetalNode state machine.
//!
//! One pass reads the node, refreshes BMC reachability, takes at most one
//! lifecycle step and writes the status back as a single merge patch when
//! anything changed. Desired state is never touched here.

use super::Reconciler;
use crate::config::DrainTimeoutPolicy;
use crate::error::ControllerError;
use crate::runtime::DrainProgress;
use crate::scheduler::ReconcileAction;
use chrono::{DateTime, Utc};
use crds::{BareMetalNode, BareMetalNodeStatus, DesiredPowerState, NodeState, ObservedPowerState, PowerAction};
use kube::ResourceExt;
use power_driver::{FailureClass, Operation, PowerError, PowerStatus};
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// How a pass ends once its status has been written.
#[derive(Debug)]
enum Step {
    Requeue(Duration),
    /// Let the queue retry with backoff
    Backoff(ControllerError),
}

fn elapsed_since(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    since
        .and_then(|t| (now - t).to_std().ok())
        .unwrap_or_default()
}

fn observed(status: PowerStatus) -> ObservedPowerState {
    match status {
        PowerStatus::On => ObservedPowerState::On,
        PowerStatus::Off => ObservedPowerState::Off,
        PowerStatus::Unknown => ObservedPowerState::Unknown,
    }
}

impl Reconciler {
    /// Reconciles one BareMetalNode by name.
    pub async fn reconcile_node(&self, name: &str) -> Result<ReconcileAction, ControllerError> {
        let span = info_span!("reconcile_node", node = %name, id = %Uuid::new_v4());
        self.reconcile_node_inner(name).instrument(span).await
    }

    async fn reconcile_node_inner(&self, name: &str) -> Result<ReconcileAction, ControllerError> {
        let Some(node) = self.backends.nodes.get_node(name).await? else {
            debug!("BareMetalNode no longer exists");
            self.forget_health(name);
            return Ok(ReconcileAction::Done);
        };
        let now = Utc::now();

        let current = node.status.clone();
        let mut status = current.clone().unwrap_or_default();
        if status.state_since.is_none() {
            status.state_since = Some(now);
        }

        self.refresh_reachability(&node, &mut status, now).await;

        let step = match status.state {
            NodeState::Off => self.step_off(&node, &mut status, now).await?,
            NodeState::PoweringOn => self.step_powering_on(&node, &mut status, now).await?,
            NodeState::Ready => self.step_ready(&node, &mut status, now).await?,
            NodeState::Draining => self.step_draining(&node, &mut status, now).await?,
            NodeState::Error => self.step_error(&node, &mut status, now)?,
        };

        status.observed_generation = node.metadata.generation;
        self.write_status(&node, current.as_ref(), &status).await?;

        match step {
            Step::Requeue(delay) => Ok(ReconcileAction::Requeue(delay)),
            Step::Backoff(err) => Err(err),
        }
    }

    /// Write `status` if it differs from what is stored.
    async fn write_status(
        &self,
        node: &BareMetalNode,
        current: Option<&BareMetalNodeStatus>,
        status: &BareMetalNodeStatus,
    ) -> Result<(), ControllerError> {
        if current == Some(status) {
            return Ok(());
        }
        self.backends.nodes.update_node_status(node, status).await?;

        let from = current.map(|s| s.state).unwrap_or_default();
        if from != status.state {
            self.metrics
                .transitions
                .with_label_values(&[from.as_str(), status.state.as_str()])
                .inc();
        }
        Ok(())
    }

    /// Probe the BMC and record what it says about reachability and power.
    async fn refresh_reachability(&self, node: &BareMetalNode, status: &mut BareMetalNodeStatus, now: DateTime<Utc>) {
        let name = node.name_any();
        match self.driver_call(node, Operation::QueryPowerState).await {
            Ok(power) => {
                self.mark_reachable(&name);
                status.bmc_reachable = true;
                status.power_state = observed(power);
            }
            Err(e) if e.class() == FailureClass::Connectivity => {
                let since = self.mark_unreachable(&name, now);
                debug!(error = %e, unreachable_since = %since, "BMC unreachable");
                status.bmc_reachable = false;
            }
            Err(e) => {
                debug!(error = %e, "Power state query failed");
                self.mark_reachable(&name);
                status.bmc_reachable = true;
            }
        }
    }

    fn transition(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        to: NodeState,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(ControllerError::InvalidTransition {
                node: node.name_any(),
                from,
                to,
            });
        }
        info!(from = %from, to = %to, "State transition");
        status.state = to;
        status.state_since = Some(now);
        Ok(())
    }

    fn fail(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        warn!(error = %message, "Node entering error state");
        self.transition(node, status, NodeState::Error, now)?;
        status.last_error = Some(message);
        status.node_ready = false;
        Ok(Step::Requeue(self.config.resync_interval))
    }

    /// Fold a failed power command into the lifecycle.
    fn power_failure(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        operation: Operation,
        err: PowerError,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        let name = node.name_any();
        match err.class() {
            FailureClass::Terminal => self.fail(node, status, format!("{operation} failed: {err}"), now),
            FailureClass::Connectivity => {
                status.bmc_reachable = false;
                let since = self.mark_unreachable(&name, now);
                let outage = elapsed_since(Some(since), now);
                if outage >= self.config.bmc_grace_period {
                    self.fail(
                        node,
                        status,
                        format!("BMC unreachable for {}s: {err}", outage.as_secs()),
                        now,
                    )
                } else {
                    Ok(Step::Backoff(err.into()))
                }
            }
            FailureClass::Transient => {
                let failures = self.record_transient_failure(&name);
                if failures >= self.config.driver_retry_budget {
                    self.fail(
                        node,
                        status,
                        format!("{operation} failed {failures} times in a row: {err}"),
                        now,
                    )
                } else {
                    debug!(failures, budget = self.config.driver_retry_budget, "Transient driver failure");
                    Ok(Step::Backoff(err.into()))
                }
            }
        }
    }

    async fn step_off(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        if node.spec.power_state == DesiredPowerState::Off {
            return Ok(Step::Requeue(self.config.resync_interval));
        }

        if status.power_state == ObservedPowerState::On {
            debug!("Machine already powered on");
        } else {
            match self.driver_call(node, Operation::PowerOn).await {
                Ok(_) => {
                    self.reset_failures(&node.name_any());
                    status.last_power_action = Some(PowerAction::PowerOn);
                    status.power_action_time = Some(now);
                }
                Err(e) => return self.power_failure(node, status, Operation::PowerOn, e, now),
            }
        }

        self.transition(node, status, NodeState::PoweringOn, now)?;
        status.last_error = None;
        Ok(Step::Requeue(self.config.transition_poll))
    }

    async fn step_powering_on(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        let name = node.name_any();
        if let Some(runtime_node) = self.backends.runtime.find_node(&name).await?
            && runtime_node.ready
        {
            if runtime_node.unschedulable {
                self.backends.runtime.uncordon(&runtime_node.name).await?;
            }
            self.transition(node, status, NodeState::Ready, now)?;
            status.boot_time = Some(runtime_node.registered_at.unwrap_or(now));
            status.join_time = Some(now);
            status.kubernetes_node = Some(runtime_node.name);
            status.node_ready = true;
            status.power_state = ObservedPowerState::On;
            status.last_error = None;
            // A desired-off flip during boot is handled by the next pass.
            let delay = if node.spec.power_state == DesiredPowerState::Off {
                Duration::ZERO
            } else {
                self.config.resync_interval
            };
            return Ok(Step::Requeue(delay));
        }

        let booting = elapsed_since(status.state_since, now);
        if booting >= self.config.boot_timeout {
            return self.fail(
                node,
                status,
                format!("node did not join within {}s", self.config.boot_timeout.as_secs()),
                now,
            );
        }

        if !status.bmc_reachable {
            let since = self.mark_unreachable(&name, now);
            let outage = elapsed_since(Some(since), now);
            if outage >= self.config.bmc_grace_period {
                return self.fail(node, status, format!("BMC unreachable for {}s", outage.as_secs()), now);
            }
        }

        Ok(Step::Requeue(self.config.transition_poll))
    }

    async fn step_ready(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        let name = node.name_any();
        let runtime_name = status.kubernetes_node.clone().unwrap_or_else(|| name.clone());

        if node.spec.power_state == DesiredPowerState::Off {
            info!(runtime_node = %runtime_name, "Cordoning and draining");
            self.drain(&runtime_name).await?;
            self.transition(node, status, NodeState::Draining, now)?;
            return Ok(Step::Requeue(self.config.transition_poll));
        }

        let runtime_node = self.backends.runtime.find_node(&name).await?;
        status.node_ready = runtime_node.as_ref().is_some_and(|n| n.ready);
        if let Some(runtime_node) = runtime_node {
            status.kubernetes_node = Some(runtime_node.name);
        }
        Ok(Step::Requeue(self.config.resync_interval))
    }

    /// Cordon and evict. A runtime node that no longer exists has nothing
    /// left to drain.
    async fn drain(&self, runtime_name: &str) -> Result<(), ControllerError> {
        match self.backends.runtime.cordon_and_drain(runtime_name).await {
            Err(ControllerError::NotFound(what)) => {
                info!(runtime_node = %runtime_name, missing = %what, "Runtime node is gone, treating as drained");
                Ok(())
            }
            result => result,
        }
    }

    async fn step_draining(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        let runtime_name = status.kubernetes_node.clone().unwrap_or_else(|| node.name_any());

        match self.backends.runtime.drain_progress(&runtime_name).await? {
            DrainProgress::Complete => {
                debug!(runtime_node = %runtime_name, "Drain complete");
            }
            DrainProgress::Pending { remaining } => {
                let draining = elapsed_since(status.state_since, now);
                if draining < self.config.drain_timeout {
                    self.drain(&runtime_name).await?;
                    debug!(runtime_node = %runtime_name, remaining, "Drain in progress");
                    return Ok(Step::Requeue(self.config.transition_poll));
                }
                match self.config.drain_timeout_policy {
                    DrainTimeoutPolicy::ForcePowerOff => {
                        warn!(runtime_node = %runtime_name, remaining, "Drain timed out, powering off anyway");
                    }
                    DrainTimeoutPolicy::HoldAndAlert => {
                        let message = format!(
                            "drain of {runtime_name} exceeded {}s with {remaining} pods left",
                            self.config.drain_timeout.as_secs()
                        );
                        warn!(runtime_node = %runtime_name, remaining, "Drain timed out, holding node in draining");
                        status.last_error = Some(message);
                        self.drain(&runtime_name).await?;
                        return Ok(Step::Requeue(self.config.transition_poll));
                    }
                }
            }
        }

        if status.power_state == ObservedPowerState::Off {
            debug!("Machine already powered off");
        } else {
            match self.driver_call(node, Operation::PowerOff).await {
                Ok(_) => {
                    self.reset_failures(&node.name_any());
                    status.last_power_action = Some(PowerAction::PowerOff);
                    status.power_action_time = Some(now);
                }
                Err(e) => return self.power_failure(node, status, Operation::PowerOff, e, now),
            }
        }

        self.transition(node, status, NodeState::Off, now)?;
        status.power_state = ObservedPowerState::Off;
        status.node_ready = false;
        status.kubernetes_node = None;
        status.last_error = None;
        let delay = if node.spec.power_state == DesiredPowerState::On {
            Duration::ZERO
        } else {
            self.config.resync_interval
        };
        Ok(Step::Requeue(delay))
    }

    fn step_error(
        &self,
        node: &BareMetalNode,
        status: &mut BareMetalNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Step, ControllerError> {
        let since = status.state_since;
        let reset_requested = match (node.reset_requested_at(), since) {
            (Some(requested), Some(since)) => requested > since,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let spec_changed = matches!(
            (node.metadata.generation, status.observed_generation),
            (Some(generation), Some(observed)) if generation > observed
        );
        let in_error = elapsed_since(since, now);
        let cooled_down = self.config.auto_recover && in_error >= self.config.error_cooldown;

        if !(reset_requested || spec_changed || cooled_down) {
            let delay = if self.config.auto_recover {
                self.config
                    .error_cooldown
                    .saturating_sub(in_error)
                    .min(self.config.resync_interval)
            } else {
                self.config.resync_interval
            };
            return Ok(Step::Requeue(delay));
        }

        info!(reset_requested, spec_changed, cooled_down, "Resetting node");
        self.reset_failures(&node.name_any());
        self.transition(node, status, NodeState::Off, now)?;
        status.last_error = None;
        status.node_ready = false;
        status.kubernetes_node = None;
        Ok(Step::Requeue(Duration::ZERO))
    }
}
