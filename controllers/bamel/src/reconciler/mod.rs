//! Reconciliation logic.
//!
//! `Reconciler` carries everything the two control loops share: the store,
//! power, runtime and credential backends, the pool index, configuration
//! and metrics. The node state machine lives in `node`, the pool autoscaler
//! loop in `autoscaler`, and the pure scaling arithmetic in `scaling`.

mod autoscaler;
mod node;
pub mod scaling;

#[cfg(test)]
mod autoscaler_test;

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::metrics::Metrics;
use crate::pool_index::PoolIndex;
use crate::runtime::RuntimeCluster;
use crate::store::{NodeStore, PolicyStore};
use chrono::{DateTime, Utc};
use crds::{BareMetalNode, PowerInterface};
use power_driver::{BmcTarget, Credentials, FailureClass, Operation, PowerControl, PowerError, PowerStatus, Protocol};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tracing::debug;

/// External systems the reconcilers talk to.
#[derive(Clone)]
pub struct Backends {
    pub nodes: Arc<dyn NodeStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub power: Arc<dyn PowerControl>,
    pub runtime: Arc<dyn RuntimeCluster>,
    pub credentials: Arc<dyn CredentialResolver>,
}

/// Per-node BMC health, kept in memory only.
#[derive(Debug, Clone, Copy, Default)]
struct DriverHealth {
    /// Transient power command failures since the last successful command
    consecutive_failures: u32,
    /// First connectivity failure of the current outage
    unreachable_since: Option<DateTime<Utc>>,
}

/// Reconciles BareMetalNode and BamelAutoscaler resources.
pub struct Reconciler {
    backends: Backends,
    index: Arc<PoolIndex>,
    config: Config,
    metrics: Arc<Metrics>,
    driver_permits: Semaphore,
    driver_health: Mutex<HashMap<String, DriverHealth>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(backends: Backends, index: Arc<PoolIndex>, config: Config, metrics: Arc<Metrics>) -> Self {
        let driver_permits = Semaphore::new(config.max_concurrent_driver_calls);
        Self {
            backends,
            index,
            config,
            metrics,
            driver_permits,
            driver_health: Mutex::new(HashMap::new()),
        }
    }

    fn health(&self) -> MutexGuard<'_, HashMap<String, DriverHealth>> {
        self.driver_health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_health(&self, node: &str) {
        self.health().remove(node);
    }

    /// Start (or continue) an outage; returns when it began.
    fn mark_unreachable(&self, node: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        *self
            .health()
            .entry(node.to_string())
            .or_default()
            .unreachable_since
            .get_or_insert(now)
    }

    fn mark_reachable(&self, node: &str) {
        if let Some(health) = self.health().get_mut(node) {
            health.unreachable_since = None;
        }
    }

    /// Count one more transient command failure; returns the running total.
    fn record_transient_failure(&self, node: &str) -> u32 {
        let mut health = self.health();
        let entry = health.entry(node.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.consecutive_failures
    }

    fn reset_failures(&self, node: &str) {
        if let Some(health) = self.health().get_mut(node) {
            health.consecutive_failures = 0;
        }
    }

    async fn credentials_for(&self, node: &BareMetalNode) -> Result<Credentials, PowerError> {
        let secret = node.spec.bmc_credentials.trim();
        if secret.is_empty() {
            return Err(PowerError::Unauthorized("no bmcCredentials secret configured".to_string()));
        }
        self.backends
            .credentials
            .resolve(secret)
            .await
            .map_err(|e| PowerError::Unauthorized(e.to_string()))
    }

    /// Run one power operation against `node`'s BMC.
    ///
    /// Credentials are resolved for every call (WoL needs none) and the call
    /// holds one of the global driver permits while it runs.
    async fn driver_call(&self, node: &BareMetalNode, operation: Operation) -> Result<PowerStatus, PowerError> {
        let target = bmc_target(node);
        let result = self.driver_call_inner(node, &target, operation).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => match e.class() {
                FailureClass::Transient => "transient",
                FailureClass::Connectivity => "unreachable",
                FailureClass::Terminal => "terminal",
            },
        };
        self.metrics
            .driver_calls
            .with_label_values(&[target.protocol.as_str(), operation.as_str(), outcome])
            .inc();
        result
    }

    async fn driver_call_inner(
        &self,
        node: &BareMetalNode,
        target: &BmcTarget,
        operation: Operation,
    ) -> Result<PowerStatus, PowerError> {
        let credentials = if target.protocol.needs_credentials() {
            Some(self.credentials_for(node).await?)
        } else {
            None
        };

        let _permit = self
            .driver_permits
            .acquire()
            .await
            .map_err(|e| PowerError::Transient(e.to_string()))?;
        debug!(address = %target.address, interface = %target.protocol, operation = %operation, "Driver call");

        let power = &self.backends.power;
        match operation {
            Operation::PowerOn => power.power_on(target, credentials.as_ref()).await.map(|()| PowerStatus::On),
            Operation::PowerOff => power.power_off(target, credentials.as_ref()).await.map(|()| PowerStatus::Off),
            Operation::QueryPowerState => power.query_power_state(target, credentials.as_ref()).await,
        }
    }
}

fn protocol_for(interface: PowerInterface) -> Protocol {
    match interface {
        PowerInterface::Redfish => Protocol::Redfish,
        PowerInterface::Ipmi => Protocol::Ipmi,
        PowerInterface::Wol => Protocol::Wol,
    }
}

pub(crate) fn bmc_target(node: &BareMetalNode) -> BmcTarget {
    BmcTarget::new(
        protocol_for(node.spec.power_interface),
        node.spec.mgmt_address.clone(),
        node.spec.mac_address.clone(),
    )
}
