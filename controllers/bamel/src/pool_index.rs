//! Pool index.
//!
//! Process-local view of every BareMetalNode grouped by `spec.pool`. It is
//! fed only from node observations (watch events and the autoscaler's own
//! patch results) and read by the autoscaler with eventual consistency.
//! Never persisted; rebuilt from the initial list after a restart.

use chrono::{DateTime, Utc};
use crds::{BareMetalNode, DesiredPowerState, NodeState, ResourceAmounts};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use tracing::debug;

/// What the autoscaler needs to know about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub name: String,
    pub pool: String,
    pub state: NodeState,
    pub desired: DesiredPowerState,
    pub rack: Option<String>,
    pub capacity: ResourceAmounts,
    pub join_time: Option<DateTime<Utc>>,
    pub kubernetes_node: Option<String>,
    /// A reset was requested after the node entered its current state
    pub reset_pending: bool,
}

impl NodeEntry {
    pub fn from_node(node: &BareMetalNode) -> Option<Self> {
        let name = node.metadata.name.clone()?;
        let capacity = node.spec.resources.amounts().unwrap_or_else(|e| {
            debug!(node = %name, error = %e, "Unparseable capacity, counting it as zero");
            ResourceAmounts::default()
        });
        let status = node.status.as_ref();
        let state_since = status.and_then(|s| s.state_since);
        let reset_pending = match (node.reset_requested_at(), state_since) {
            (Some(requested), Some(since)) => requested > since,
            (Some(_), None) => true,
            _ => false,
        };
        Some(Self {
            name,
            pool: node.spec.pool.clone(),
            state: node.state(),
            desired: node.spec.power_state,
            rack: node.spec.rack.clone(),
            capacity,
            join_time: status.and_then(|s| s.join_time),
            kubernetes_node: status.and_then(|s| s.kubernetes_node.clone()),
            reset_pending,
        })
    }

    /// Ready and still wanted.
    pub fn is_active(&self) -> bool {
        self.state == NodeState::Ready && self.desired == DesiredPowerState::On
    }

    /// Commanded on but not ready yet.
    pub fn is_pending(&self) -> bool {
        match self.state {
            NodeState::PoweringOn => true,
            NodeState::Off => self.desired == DesiredPowerState::On,
            NodeState::Error => self.desired == DesiredPowerState::On && self.reset_pending,
            NodeState::Ready | NodeState::Draining => false,
        }
    }

    /// Commanded off and not yet powered down.
    pub fn is_leaving(&self) -> bool {
        match self.state {
            NodeState::Draining => true,
            NodeState::Ready => self.desired == DesiredPowerState::Off,
            NodeState::Off | NodeState::PoweringOn | NodeState::Error => false,
        }
    }
}

/// Node counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub off: u32,
    pub powering_on: u32,
    pub ready: u32,
    pub draining: u32,
    pub error: u32,
}

impl StateCounts {
    fn add(&mut self, state: NodeState) {
        let slot = match state {
            NodeState::Off => &mut self.off,
            NodeState::PoweringOn => &mut self.powering_on,
            NodeState::Ready => &mut self.ready,
            NodeState::Draining => &mut self.draining,
            NodeState::Error => &mut self.error,
        };
        *slot += 1;
    }

    pub fn by_state(&self) -> [(NodeState, u32); 5] {
        [
            (NodeState::Off, self.off),
            (NodeState::PoweringOn, self.powering_on),
            (NodeState::Ready, self.ready),
            (NodeState::Draining, self.draining),
            (NodeState::Error, self.error),
        ]
    }

    pub fn total(&self) -> u32 {
        self.off + self.powering_on + self.ready + self.draining + self.error
    }
}

/// Point-in-time copy of one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSnapshot {
    pub pool: String,
    /// Entries sorted by node name
    pub nodes: Vec<NodeEntry>,
    pub counts: StateCounts,
}

#[derive(Debug, Default)]
struct IndexState {
    pools: HashMap<String, BTreeMap<String, NodeEntry>>,
    /// node name -> pool
    membership: HashMap<String, String>,
}

impl IndexState {
    fn upsert(&mut self, entry: NodeEntry) -> Vec<String> {
        let mut changed = Vec::new();
        if let Some(old_pool) = self.membership.get(&entry.name).cloned() {
            if old_pool != entry.pool {
                self.detach(&entry.name, &old_pool);
                changed.push(old_pool);
            }
        }
        self.membership.insert(entry.name.clone(), entry.pool.clone());
        let pool = entry.pool.clone();
        let members = self.pools.entry(pool.clone()).or_default();
        let previous = members.insert(entry.name.clone(), entry.clone());
        if previous.as_ref() != Some(&entry) {
            changed.push(pool);
        }
        changed
    }

    fn detach(&mut self, name: &str, pool: &str) {
        if let Some(members) = self.pools.get_mut(pool) {
            members.remove(name);
            if members.is_empty() {
                self.pools.remove(pool);
            }
        }
    }
}

type Listener = Box<dyn Fn(&str) + Send + Sync>;

/// Nodes grouped by pool.
pub struct PoolIndex {
    state: RwLock<IndexState>,
    /// Called with each pool whose content changed, outside the lock
    listener: Option<Listener>,
}

impl std::fmt::Debug for PoolIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolIndex")
            .field("state", &self.state)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for PoolIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            listener: None,
        }
    }

    pub fn with_listener<F>(listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            state: RwLock::new(IndexState::default()),
            listener: Some(Box::new(listener)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, pools: impl IntoIterator<Item = String>) {
        if let Some(listener) = &self.listener {
            let unique: BTreeSet<String> = pools.into_iter().collect();
            for pool in unique {
                listener(&pool);
            }
        }
    }

    /// Record the latest observation of a node.
    pub fn apply(&self, node: &BareMetalNode) {
        let Some(entry) = NodeEntry::from_node(node) else {
            return;
        };
        let changed = self.write().upsert(entry);
        self.notify(changed);
    }

    /// Forget a deleted node.
    pub fn remove(&self, name: &str) {
        let changed = {
            let mut state = self.write();
            state.membership.remove(name).map(|pool| {
                state.detach(name, &pool);
                pool
            })
        };
        self.notify(changed);
    }

    /// Replace the whole index with a fresh listing.
    pub fn rebuild(&self, nodes: &[BareMetalNode]) {
        let mut fresh = IndexState::default();
        for node in nodes {
            if let Some(entry) = NodeEntry::from_node(node) {
                fresh.upsert(entry);
            }
        }
        let changed: Vec<String> = {
            let mut state = self.write();
            let old = std::mem::replace(&mut *state, fresh);
            old.pools.into_keys().chain(state.pools.keys().cloned()).collect()
        };
        self.notify(changed);
    }

    pub fn snapshot(&self, pool: &str) -> PoolSnapshot {
        let state = self.read();
        let mut snapshot = PoolSnapshot {
            pool: pool.to_string(),
            ..PoolSnapshot::default()
        };
        if let Some(members) = state.pools.get(pool) {
            for entry in members.values() {
                snapshot.counts.add(entry.state);
                snapshot.nodes.push(entry.clone());
            }
        }
        snapshot
    }

    pub fn counts(&self, pool: &str) -> StateCounts {
        self.snapshot(pool).counts
    }

    /// Pools that currently have members, sorted.
    #[cfg(test)]
    pub fn pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.read().pools.keys().cloned().collect();
        pools.sort();
        pools
    }

    pub fn entry(&self, name: &str) -> Option<NodeEntry> {
        let state = self.read();
        let pool = state.membership.get(name)?;
        state.pools.get(pool)?.get(name).cloned()
    }

    /// BareMetalNode whose status names `runtime_node` as its cluster node.
    pub fn find_by_kubernetes_node(&self, runtime_node: &str) -> Option<String> {
        let state = self.read();
        state
            .pools
            .values()
            .flat_map(BTreeMap::values)
            .find(|e| e.kubernetes_node.as_deref() == Some(runtime_node))
            .map(|e| e.name.clone())
    }
}
