//! In-memory backends and builders shared by the controller tests.

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::pool_index::PoolIndex;
use crate::reconciler::{Backends, Reconciler};
use crate::runtime::{DrainProgress, RuntimeCluster, RuntimeNode};
use crate::scheduler::ReconcileAction;
use crate::store::{NodeStore, PolicyStore};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use crds::{
    BamelAutoscaler, BamelAutoscalerStatus, BareMetalNode, BareMetalNodeSpec, BareMetalNodeStatus, DesiredPowerState,
    NodeState, ObservedPowerState, PowerInterface, RESET_ANNOTATION, ResourceAmounts, ResourceCapacity,
};
use kube::ResourceExt;
use power_driver::{Credentials, MockPowerControl};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreState {
    nodes: BTreeMap<String, BareMetalNode>,
    policies: BTreeMap<String, BamelAutoscaler>,
    resource_version: u64,
    /// Node names whose next write fails with a conflict
    conflicts: HashSet<String>,
    status_writes: usize,
    spec_writes: usize,
    policy_status_writes: usize,
}

impl StoreState {
    fn next_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    /// Stored copy of `node`, provided the caller saw the latest version.
    fn checked(&mut self, node: &BareMetalNode) -> Result<&mut BareMetalNode, ControllerError> {
        let name = node.name_any();
        if self.conflicts.remove(&name) {
            return Err(ControllerError::Conflict(format!("BareMetalNode {name}")));
        }
        let stored = self
            .nodes
            .get_mut(&name)
            .ok_or_else(|| ControllerError::NotFound(format!("BareMetalNode {name}")))?;
        if stored.metadata.resource_version != node.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("BareMetalNode {name}")));
        }
        Ok(stored)
    }
}

/// In-memory `NodeStore` and `PolicyStore` with resourceVersion checks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Insert or replace a node, assigning a fresh resourceVersion.
    pub fn insert_node(&self, mut node: BareMetalNode) -> BareMetalNode {
        let mut state = self.lock();
        node.metadata.resource_version = state.next_version();
        node.metadata.generation.get_or_insert(1);
        state.nodes.insert(node.name_any(), node.clone());
        node
    }

    pub fn node(&self, name: &str) -> BareMetalNode {
        self.lock().nodes.get(name).cloned().unwrap()
    }

    pub fn nodes(&self) -> Vec<BareMetalNode> {
        self.lock().nodes.values().cloned().collect()
    }

    /// Edit a stored node the way an operator would; spec edits bump the generation.
    pub fn modify_node(&self, name: &str, edit: impl FnOnce(&mut BareMetalNode)) -> BareMetalNode {
        let mut state = self.lock();
        let version = state.next_version();
        let node = state.nodes.get_mut(name).unwrap();
        let spec_before = node.spec.clone();
        edit(node);
        if node.spec != spec_before {
            node.metadata.generation = Some(node.metadata.generation.unwrap_or(1) + 1);
        }
        node.metadata.resource_version = version;
        node.clone()
    }

    pub fn insert_policy(&self, policy: BamelAutoscaler) {
        self.lock().policies.insert(policy.name_any(), policy);
    }

    pub fn policy(&self, name: &str) -> BamelAutoscaler {
        self.lock().policies.get(name).cloned().unwrap()
    }

    /// Fail the next write to `name` with a conflict.
    pub fn conflict_next(&self, name: &str) {
        self.lock().conflicts.insert(name.to_string());
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    pub fn spec_writes(&self) -> usize {
        self.lock().spec_writes
    }

    pub fn policy_status_writes(&self) -> usize {
        self.lock().policy_status_writes
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryStore {
    async fn get_node(&self, name: &str) -> Result<Option<BareMetalNode>, ControllerError> {
        Ok(self.lock().nodes.get(name).cloned())
    }

    async fn update_node_status(
        &self,
        node: &BareMetalNode,
        status: &BareMetalNodeStatus,
    ) -> Result<BareMetalNode, ControllerError> {
        let mut state = self.lock();
        let version = state.next_version();
        let stored = state.checked(node)?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }

    async fn set_desired_power(
        &self,
        node: &BareMetalNode,
        desired: DesiredPowerState,
        reset_requested_at: Option<DateTime<Utc>>,
    ) -> Result<BareMetalNode, ControllerError> {
        let mut state = self.lock();
        let version = state.next_version();
        let stored = state.checked(node)?;
        if stored.spec.power_state != desired {
            stored.spec.power_state = desired;
            stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        }
        if let Some(at) = reset_requested_at {
            stored.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(
                RESET_ANNOTATION.to_string(),
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        state.spec_writes += 1;
        Ok(updated)
    }
}

#[async_trait::async_trait]
impl PolicyStore for MemoryStore {
    async fn list_policies(&self) -> Result<Vec<BamelAutoscaler>, ControllerError> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    async fn update_policy_status(
        &self,
        policy: &BamelAutoscaler,
        status: &BamelAutoscalerStatus,
    ) -> Result<(), ControllerError> {
        let mut state = self.lock();
        let name = policy.name_any();
        let stored = state
            .policies
            .get_mut(&name)
            .ok_or_else(|| ControllerError::NotFound(format!("BamelAutoscaler {name}")))?;
        stored.status = Some(status.clone());
        state.policy_status_writes += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    /// Runtime nodes keyed by the machine they run on
    nodes: HashMap<String, RuntimeNode>,
    pods: HashMap<String, usize>,
    allocated: HashMap<String, ResourceAmounts>,
    cordoned: Vec<String>,
    uncordoned: Vec<String>,
    failing: bool,
}

/// Scriptable stand-in for the runtime cluster.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    /// Register a runtime node named like its machine.
    pub fn join(&self, machine: &str, ready: bool) {
        self.set_node(
            machine,
            RuntimeNode {
                name: machine.to_string(),
                ready,
                unschedulable: false,
                registered_at: None,
            },
        );
    }

    pub fn set_node(&self, machine: &str, node: RuntimeNode) {
        self.lock().nodes.insert(machine.to_string(), node);
    }

    pub fn runtime_node(&self, machine: &str) -> Option<RuntimeNode> {
        self.lock().nodes.get(machine).cloned()
    }

    /// Evictable pods left on `node`.
    pub fn set_pods(&self, node: &str, pods: usize) {
        self.lock().pods.insert(node.to_string(), pods);
    }

    pub fn set_allocated(&self, node: &str, amounts: ResourceAmounts) {
        self.lock().allocated.insert(node.to_string(), amounts);
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn cordoned(&self) -> Vec<String> {
        self.lock().cordoned.clone()
    }

    pub fn uncordoned(&self) -> Vec<String> {
        self.lock().uncordoned.clone()
    }

    fn check(&self) -> Result<MutexGuard<'_, RuntimeState>, ControllerError> {
        let state = self.lock();
        if state.failing {
            return Err(ControllerError::Runtime("runtime cluster unavailable".to_string()));
        }
        Ok(state)
    }

    /// Mirrors the API server: patching a Node that does not exist is a 404.
    fn set_unschedulable(state: &mut RuntimeState, node: &str, unschedulable: bool) -> Result<(), ControllerError> {
        let mut found = false;
        for runtime_node in state.nodes.values_mut().filter(|n| n.name == node) {
            runtime_node.unschedulable = unschedulable;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(ControllerError::NotFound(format!("Node {node}")))
        }
    }

    pub fn remove_node(&self, machine: &str) {
        self.lock().nodes.remove(machine);
    }
}

#[async_trait::async_trait]
impl RuntimeCluster for FakeRuntime {
    async fn find_node(&self, machine: &str) -> Result<Option<RuntimeNode>, ControllerError> {
        Ok(self.check()?.nodes.get(machine).cloned())
    }

    async fn uncordon(&self, node: &str) -> Result<(), ControllerError> {
        let mut state = self.check()?;
        Self::set_unschedulable(&mut state, node, false)?;
        state.uncordoned.push(node.to_string());
        Ok(())
    }

    async fn cordon_and_drain(&self, node: &str) -> Result<(), ControllerError> {
        let mut state = self.check()?;
        Self::set_unschedulable(&mut state, node, true)?;
        state.cordoned.push(node.to_string());
        Ok(())
    }

    async fn drain_progress(&self, node: &str) -> Result<DrainProgress, ControllerError> {
        let remaining = self.check()?.pods.get(node).copied().unwrap_or(0);
        Ok(if remaining == 0 {
            DrainProgress::Complete
        } else {
            DrainProgress::Pending { remaining }
        })
    }

    async fn allocated(&self, node: &str) -> Result<ResourceAmounts, ControllerError> {
        Ok(self.check()?.allocated.get(node).copied().unwrap_or_default())
    }
}

/// Resolves every Secret to the same credentials.
#[derive(Debug, Default)]
pub struct StaticCredentials;

#[async_trait::async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, _secret_name: &str) -> Result<Credentials, ControllerError> {
        Ok(Credentials::new("admin", "secret"))
    }
}

/// A powered-off IPMI node with 32 CPUs and 128Gi of memory.
pub fn test_node(name: &str, pool: &str) -> BareMetalNode {
    let mut node = BareMetalNode::new(
        name,
        BareMetalNodeSpec {
            mgmt_address: format!("bmc-{name}"),
            mac_address: "aa:bb:cc:dd:ee:01".to_string(),
            power_interface: PowerInterface::Ipmi,
            bmc_credentials: format!("{name}-bmc"),
            boot_profile: "talos".to_string(),
            rack: None,
            pool: pool.to_string(),
            resources: ResourceCapacity {
                cpu_capacity: "32".to_string(),
                memory_capacity: "128Gi".to_string(),
                ..ResourceCapacity::default()
            },
            power_state: DesiredPowerState::Off,
            inventory_id: None,
        },
    );
    node.metadata.generation = Some(1);
    node.metadata.resource_version = Some("1".to_string());
    node
}

/// A node that entered `state` a minute ago.
pub fn node_in_state(name: &str, pool: &str, state: NodeState, desired: DesiredPowerState) -> BareMetalNode {
    let now = Utc::now();
    let mut node = test_node(name, pool);
    node.spec.power_state = desired;
    let powered = matches!(state, NodeState::PoweringOn | NodeState::Ready | NodeState::Draining);
    let joined = matches!(state, NodeState::Ready | NodeState::Draining);
    node.status = Some(BareMetalNodeStatus {
        state,
        state_since: Some(now - ChronoDuration::minutes(1)),
        power_state: if powered { ObservedPowerState::On } else { ObservedPowerState::Off },
        kubernetes_node: joined.then(|| name.to_string()),
        node_ready: state == NodeState::Ready,
        bmc_reachable: true,
        join_time: joined.then(|| now - ChronoDuration::hours(1)),
        observed_generation: Some(1),
        ..BareMetalNodeStatus::default()
    });
    node
}

/// Move a node's `stateSince` into the past.
pub fn aged(mut node: BareMetalNode, age: Duration) -> BareMetalNode {
    if let Some(status) = node.status.as_mut() {
        status.state_since = Some(Utc::now() - ChronoDuration::from_std(age).unwrap());
    }
    node
}

pub fn test_policy(name: &str, pool: &str, min_ready: u32) -> BamelAutoscaler {
    BamelAutoscaler::new(
        name,
        serde_json::from_value(serde_json::json!({
            "pool": pool,
            "minReady": min_ready,
        }))
        .unwrap(),
    )
}

pub fn test_config() -> Config {
    Config {
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        ..Config::default()
    }
}

/// A reconciler wired to in-memory backends.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub power: MockPowerControl,
    pub runtime: Arc<FakeRuntime>,
    pub index: Arc<PoolIndex>,
    pub metrics: Arc<Metrics>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_index(config, Arc::new(PoolIndex::new()))
    }

    /// Build around a caller-supplied index, e.g. one wired to a pool queue.
    pub fn with_index(config: Config, index: Arc<PoolIndex>) -> Self {
        let store = Arc::new(MemoryStore::default());
        let power = MockPowerControl::new();
        let runtime = Arc::new(FakeRuntime::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let backends = Backends {
            nodes: Arc::clone(&store) as Arc<dyn NodeStore>,
            policies: Arc::clone(&store) as Arc<dyn PolicyStore>,
            power: Arc::new(power.clone()),
            runtime: Arc::clone(&runtime) as Arc<dyn RuntimeCluster>,
            credentials: Arc::new(StaticCredentials),
        };
        let reconciler = Reconciler::new(backends, Arc::clone(&index), config, Arc::clone(&metrics));
        Self {
            store,
            power,
            runtime,
            index,
            metrics,
            reconciler,
        }
    }

    /// Store a node, index it, and make the mock BMC agree with its power state.
    pub fn add_node(&self, node: BareMetalNode) -> BareMetalNode {
        let stored = self.store.insert_node(node);
        let address = stored.spec.mgmt_address.clone();
        let power = match stored.status.as_ref().map(|s| s.power_state) {
            Some(ObservedPowerState::On) => power_driver::PowerStatus::On,
            _ => power_driver::PowerStatus::Off,
        };
        self.power.set_power(&address, power);
        self.index.apply(&stored);
        stored
    }

    /// Re-index every stored node, as the watcher would after the writes.
    pub fn sync_index(&self) {
        self.index.rebuild(&self.store.nodes());
    }

    pub async fn reconcile(&self, name: &str) -> ReconcileAction {
        self.reconciler.reconcile_node(name).await.unwrap()
    }

    pub fn state(&self, name: &str) -> NodeState {
        self.store.node(name).state()
    }

    pub fn status(&self, name: &str) -> BareMetalNodeStatus {
        self.store.node(name).status.unwrap_or_default()
    }
}
