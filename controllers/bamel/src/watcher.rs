//! Kubernetes resource watchers.
//!
//! Watch events only feed the pool index and enqueue keys; all real work
//! happens in the queue workers. Watch errors are logged and the stream
//! retries with backoff.

use crate::error::ControllerError;
use crate::pool_index::PoolIndex;
use crate::runtime::runtime_node;
use crate::scheduler::WorkQueue;
use crds::{BamelAutoscaler, BareMetalNode, MACHINE_LABEL};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Watches BareMetalNodes, BamelAutoscalers and runtime Nodes.
pub struct Watcher {
    index: Arc<PoolIndex>,
    node_queue: Arc<WorkQueue<String>>,
    pool_queue: Arc<WorkQueue<String>>,
    ready: Arc<AtomicBool>,
}

/// Per-stream bookkeeping for the BareMetalNode watch.
#[derive(Debug, Default)]
pub(crate) struct NodeWatchState {
    initial: Vec<BareMetalNode>,
}

/// Per-stream bookkeeping for the BamelAutoscaler watch.
#[derive(Debug, Default)]
pub(crate) struct PolicyWatchState {
    /// autoscaler name -> pool it governs
    pools: HashMap<String, String>,
}

/// Per-stream bookkeeping for the runtime Node watch.
#[derive(Debug, Default)]
pub(crate) struct RuntimeWatchState {
    /// runtime node name -> (ready, unschedulable) last seen
    seen: HashMap<String, (bool, bool)>,
}

impl Watcher {
    pub fn new(
        index: Arc<PoolIndex>,
        node_queue: Arc<WorkQueue<String>>,
        pool_queue: Arc<WorkQueue<String>>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            node_queue,
            pool_queue,
            ready,
        }
    }

    /// Starts watching BareMetalNode resources.
    pub async fn watch_nodes(&self, api: Api<BareMetalNode>) -> Result<(), ControllerError> {
        info!("Starting BareMetalNode watcher");
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let mut state = NodeWatchState::default();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_node_event(event, &mut state),
                Err(e) => warn!(error = %e, "BareMetalNode watch error"),
            }
        }
        Err(ControllerError::Watch("BareMetalNode watch stream ended".to_string()))
    }

    /// Starts watching BamelAutoscaler resources.
    pub async fn watch_policies(&self, api: Api<BamelAutoscaler>) -> Result<(), ControllerError> {
        info!("Starting BamelAutoscaler watcher");
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let mut state = PolicyWatchState::default();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_policy_event(event, &mut state),
                Err(e) => warn!(error = %e, "BamelAutoscaler watch error"),
            }
        }
        Err(ControllerError::Watch("BamelAutoscaler watch stream ended".to_string()))
    }

    /// Starts watching runtime cluster Nodes.
    pub async fn watch_runtime_nodes(&self, api: Api<Node>) -> Result<(), ControllerError> {
        info!("Starting runtime Node watcher");
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let mut state = RuntimeWatchState::default();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_runtime_event(event, &mut state),
                Err(e) => warn!(error = %e, "Node watch error"),
            }
        }
        Err(ControllerError::Watch("Node watch stream ended".to_string()))
    }

    pub(crate) fn handle_node_event(&self, event: watcher::Event<BareMetalNode>, state: &mut NodeWatchState) {
        match event {
            watcher::Event::Init => {
                debug!("BareMetalNode list starting");
                state.initial.clear();
            }
            watcher::Event::InitApply(node) => {
                self.node_queue.add(node.name_any());
                state.initial.push(node);
            }
            watcher::Event::InitDone => {
                self.index.rebuild(&state.initial);
                info!(nodes = state.initial.len(), "BareMetalNode list complete");
                state.initial.clear();
                self.ready.store(true, Ordering::SeqCst);
            }
            watcher::Event::Apply(node) => {
                let name = node.name_any();
                debug!(node = %name, "BareMetalNode applied");
                self.index.apply(&node);
                self.node_queue.add(name);
            }
            watcher::Event::Delete(node) => {
                let name = node.name_any();
                info!(node = %name, "BareMetalNode deleted");
                self.index.remove(&name);
                self.node_queue.add(name);
            }
        }
    }

    pub(crate) fn handle_policy_event(&self, event: watcher::Event<BamelAutoscaler>, state: &mut PolicyWatchState) {
        match event {
            watcher::Event::Init => debug!("BamelAutoscaler list starting"),
            watcher::Event::InitApply(policy) | watcher::Event::Apply(policy) => {
                let name = policy.name_any();
                let pool = policy.spec.pool.clone();
                if let Some(previous) = state.pools.insert(name, pool.clone())
                    && previous != pool
                {
                    self.pool_queue.add(previous);
                }
                self.pool_queue.add(pool);
            }
            watcher::Event::InitDone => {
                // Pools whose autoscaler vanished while the watch was down.
                for pool in state.pools.values() {
                    self.pool_queue.add(pool.clone());
                }
            }
            watcher::Event::Delete(policy) => {
                let name = policy.name_any();
                info!(autoscaler = %name, pool = %policy.spec.pool, "BamelAutoscaler deleted");
                state.pools.remove(&name);
                self.pool_queue.add(policy.spec.pool.clone());
            }
        }
    }

    pub(crate) fn handle_runtime_event(&self, event: watcher::Event<Node>, state: &mut RuntimeWatchState) {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => {}
            watcher::Event::InitApply(node) | watcher::Event::Apply(node) => {
                let observed = runtime_node(&node);
                let key = (observed.ready, observed.unschedulable);
                // Heartbeat-only updates change nothing the state machine reads.
                if state.seen.insert(observed.name.clone(), key) == Some(key) {
                    return;
                }
                if let Some(machine) = self.machine_for(&node) {
                    debug!(runtime_node = %observed.name, node = %machine, ready = observed.ready, "Runtime node changed");
                    self.node_queue.add(machine);
                }
            }
            watcher::Event::Delete(node) => {
                state.seen.remove(&node.name_any());
                if let Some(machine) = self.machine_for(&node) {
                    self.node_queue.add(machine);
                }
            }
        }
    }

    /// BareMetalNode a runtime Node runs on, if it is one of ours.
    fn machine_for(&self, node: &Node) -> Option<String> {
        if let Some(machine) = node.labels().get(MACHINE_LABEL) {
            return Some(machine.clone());
        }
        let name = node.name_any();
        self.index
            .find_by_kubernetes_node(&name)
            .or_else(|| self.index.entry(&name).map(|e| e.name))
    }
}
