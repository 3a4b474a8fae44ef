//! Runtime cluster join.
//!
//! How a machine shows up once booted: as a Kubernetes `Node`, named like
//! its BareMetalNode or labelled with `bamel.dev/baremetal-node`. Draining
//! cordons that Node and evicts its pods through the eviction subresource,
//! which honours PodDisruptionBudgets.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::{MACHINE_LABEL, ResourceAmounts};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{EvictParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

/// A cluster node as the state machine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeNode {
    pub name: String,
    pub ready: bool,
    pub unschedulable: bool,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainProgress {
    Complete,
    Pending { remaining: usize },
}

#[async_trait::async_trait]
pub trait RuntimeCluster: Send + Sync {
    /// Cluster node running on `machine`, by name or by machine label.
    async fn find_node(&self, machine: &str) -> Result<Option<RuntimeNode>, ControllerError>;

    async fn uncordon(&self, node: &str) -> Result<(), ControllerError>;

    /// Cordon `node` and request eviction of every evictable pod on it.
    /// Safe to call repeatedly.
    async fn cordon_and_drain(&self, node: &str) -> Result<(), ControllerError>;

    async fn drain_progress(&self, node: &str) -> Result<DrainProgress, ControllerError>;

    /// Sum of the resource requests of pods scheduled on `node`.
    async fn allocated(&self, node: &str) -> Result<ResourceAmounts, ControllerError>;
}

/// Runtime cluster backed by the Kubernetes `Node` and `Pod` APIs.
#[derive(Clone)]
pub struct KubeRuntime {
    client: Client,
    nodes: Api<Node>,
    pods: Api<Pod>,
}

impl KubeRuntime {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            pods: Api::all(client.clone()),
            client,
        }
    }

    async fn pods_on(&self, node: &str) -> Result<Vec<Pod>, ControllerError> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(self.pods.list(&params).await?.items)
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), ControllerError> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_kube(e, &format!("Node {node}")))?;
        Ok(())
    }
}

/// Convert a k8s `Time` without depending on its inner representation.
fn to_chrono<T: serde::Serialize>(time: &T) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub(crate) fn runtime_node(node: &Node) -> RuntimeNode {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    RuntimeNode {
        name: node.name_any(),
        ready,
        unschedulable: node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false),
        registered_at: node.metadata.creation_timestamp.as_ref().and_then(to_chrono),
    }
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Pods a drain has to move: not terminal, not mirror pods, not DaemonSet pods.
pub(crate) fn is_evictable(pod: &Pod) -> bool {
    if is_terminal(pod) {
        return false;
    }
    if pod.annotations().contains_key("kubernetes.io/config.mirror") {
        return false;
    }
    !pod.owner_references().iter().any(|o| o.kind == "DaemonSet")
}

pub(crate) fn pod_requests(pod: &Pod) -> ResourceAmounts {
    let mut total = ResourceAmounts::default();
    let Some(spec) = pod.spec.as_ref() else {
        return total;
    };
    for container in &spec.containers {
        let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else {
            continue;
        };
        let cpu = requests.get("cpu").map(|q| q.0.as_str());
        let memory = requests.get("memory").map(|q| q.0.as_str());
        match ResourceAmounts::from_quantities(cpu, memory) {
            Ok(amounts) => total += amounts,
            Err(e) => debug!(pod = %pod.name_any(), error = %e, "Skipping unparseable resource request"),
        }
    }
    total
}

#[async_trait::async_trait]
impl RuntimeCluster for KubeRuntime {
    async fn find_node(&self, machine: &str) -> Result<Option<RuntimeNode>, ControllerError> {
        if let Some(node) = self.nodes.get_opt(machine).await? {
            return Ok(Some(runtime_node(&node)));
        }
        let params = ListParams::default().labels(&format!("{MACHINE_LABEL}={machine}"));
        let labelled = self.nodes.list(&params).await?;
        Ok(labelled.items.first().map(runtime_node))
    }

    async fn uncordon(&self, node: &str) -> Result<(), ControllerError> {
        info!(node = %node, "Uncordoning node");
        self.set_unschedulable(node, false).await
    }

    async fn cordon_and_drain(&self, node: &str) -> Result<(), ControllerError> {
        self.set_unschedulable(node, true).await?;

        for pod in self.pods_on(node).await?.iter().filter(|p| is_evictable(p)) {
            let name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => debug!(node = %node, pod = %name, namespace = %namespace, "Eviction requested"),
                // 429: blocked by a disruption budget, retried on the next pass.
                Err(kube::Error::Api(status)) if status.code == 429 || status.code == 404 => {
                    debug!(node = %node, pod = %name, code = status.code, "Eviction deferred");
                }
                Err(e) => return Err(ControllerError::Runtime(format!("evicting {namespace}/{name}: {e}"))),
            }
        }
        Ok(())
    }

    async fn drain_progress(&self, node: &str) -> Result<DrainProgress, ControllerError> {
        let remaining = self.pods_on(node).await?.iter().filter(|p| is_evictable(p)).count();
        Ok(if remaining == 0 {
            DrainProgress::Complete
        } else {
            DrainProgress::Pending { remaining }
        })
    }

    async fn allocated(&self, node: &str) -> Result<ResourceAmounts, ControllerError> {
        let mut total = ResourceAmounts::default();
        for pod in self.pods_on(node).await?.iter().filter(|p| !is_terminal(p)) {
            total += pod_requests(pod);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeCondition, NodeSpec, NodeStatus, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    fn pod(owner_kind: Option<&str>, phase: &str, cpu: &str, memory: &str) -> Pod {
        let requests = BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]);
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner_kind.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: "owner".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_evictable_filters() {
        assert!(is_evictable(&pod(Some("ReplicaSet"), "Running", "1", "1Gi")));
        assert!(is_evictable(&pod(None, "Pending", "1", "1Gi")));
        assert!(!is_evictable(&pod(Some("DaemonSet"), "Running", "1", "1Gi")));
        assert!(!is_evictable(&pod(Some("Job"), "Succeeded", "1", "1Gi")));

        let mut mirror = pod(None, "Running", "1", "1Gi");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/config.mirror".to_string(),
            "hash".to_string(),
        )]));
        assert!(!is_evictable(&mirror));
    }

    #[test]
    fn test_pod_requests() {
        let amounts = pod_requests(&pod(None, "Running", "1500m", "2Gi"));
        assert_eq!(amounts.cpu_millis, 1500);
        assert_eq!(amounts.memory_bytes, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_runtime_node_conversion() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        let converted = runtime_node(&node);
        assert!(converted.ready);
        assert!(converted.unschedulable);
        assert_eq!(converted.name, "worker-1");
        assert_eq!(converted.registered_at, None);
    }
}
