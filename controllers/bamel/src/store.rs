//! Resource store access.
//!
//! Reads and writes of BareMetalNode and BamelAutoscaler objects go through
//! these traits so reconcilers can be tested against an in-memory store.
//! Node writes are merge patches carrying the object's resourceVersion; the
//! API server rejects them with 409 when the object moved on, which surfaces
//! as `ControllerError::Conflict`.

use crate::error::ControllerError;
use chrono::{DateTime, SecondsFormat, Utc};
use crds::{BamelAutoscaler, BamelAutoscalerStatus, BareMetalNode, BareMetalNodeStatus, DesiredPowerState, RESET_ANNOTATION};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<BareMetalNode>, ControllerError>;

    /// Replace the node's status, guarded by `node`'s resourceVersion.
    async fn update_node_status(
        &self,
        node: &BareMetalNode,
        status: &BareMetalNodeStatus,
    ) -> Result<BareMetalNode, ControllerError>;

    /// Set `spec.powerState`, optionally stamping a reset request, guarded
    /// by `node`'s resourceVersion.
    async fn set_desired_power(
        &self,
        node: &BareMetalNode,
        desired: DesiredPowerState,
        reset_requested_at: Option<DateTime<Utc>>,
    ) -> Result<BareMetalNode, ControllerError>;
}

#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<BamelAutoscaler>, ControllerError>;

    async fn update_policy_status(
        &self,
        policy: &BamelAutoscaler,
        status: &BamelAutoscalerStatus,
    ) -> Result<(), ControllerError>;
}

/// Store backed by the Kubernetes API (both CRDs are cluster-scoped).
#[derive(Clone)]
pub struct KubeStore {
    nodes: Api<BareMetalNode>,
    policies: Api<BamelAutoscaler>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            policies: Api::all(client),
        }
    }
}

fn node_patch(node: &BareMetalNode, body: serde_json::Value) -> serde_json::Value {
    let mut patch = body;
    patch["metadata"]["resourceVersion"] = json!(node.resource_version());
    patch
}

#[async_trait::async_trait]
impl NodeStore for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<BareMetalNode>, ControllerError> {
        Ok(self.nodes.get_opt(name).await?)
    }

    async fn update_node_status(
        &self,
        node: &BareMetalNode,
        status: &BareMetalNodeStatus,
    ) -> Result<BareMetalNode, ControllerError> {
        let name = node.name_any();
        let patch = node_patch(node, json!({ "status": status }));
        self.nodes
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_kube(e, &format!("BareMetalNode {name} status")))
    }

    async fn set_desired_power(
        &self,
        node: &BareMetalNode,
        desired: DesiredPowerState,
        reset_requested_at: Option<DateTime<Utc>>,
    ) -> Result<BareMetalNode, ControllerError> {
        let name = node.name_any();
        let mut body = json!({ "spec": { "powerState": desired } });
        if let Some(at) = reset_requested_at {
            body["metadata"]["annotations"][RESET_ANNOTATION] = json!(at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        let patch = node_patch(node, body);
        self.nodes
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_kube(e, &format!("BareMetalNode {name} spec")))
    }
}

#[async_trait::async_trait]
impl PolicyStore for KubeStore {
    async fn list_policies(&self) -> Result<Vec<BamelAutoscaler>, ControllerError> {
        Ok(self.policies.list(&ListParams::default()).await?.items)
    }

    async fn update_policy_status(
        &self,
        policy: &BamelAutoscaler,
        status: &BamelAutoscalerStatus,
    ) -> Result<(), ControllerError> {
        let name = policy.name_any();
        self.policies
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&json!({ "status": status })))
            .await
            .map_err(|e| ControllerError::from_kube(e, &format!("BamelAutoscaler {name} status")))?;
        Ok(())
    }
}
