//! Kubernetes node inventory and annotation plumbing.
//!
//! Lists cluster nodes into a simplified [`NodeInfo`] snapshot and patches
//! node annotations where the remediation state is persisted. The policy
//! engine only sees the [`NodeInventory`] and [`AnnotationStore`] contracts,
//! so tests can substitute fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Errors from the Kubernetes API.
#[derive(Debug, Error)]
pub enum K8sError {
    /// Listing the cluster nodes failed. Fatal to the check cycle.
    #[error("failed to list nodes: {0}")]
    List(#[source] kube::Error),

    /// Patching a single node's annotations failed.
    #[error("failed to patch node {node}: {source}")]
    Patch {
        node: String,
        #[source]
        source: kube::Error,
    },
}

/// Snapshot of the node fields the remediation policy needs.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// Node name (stable unique identifier).
    pub name: String,
    /// Cloud provider id from `spec.providerID`, e.g. `hcloud://12345`.
    pub provider_id: Option<String>,
    /// When the node object was created.
    pub created_at: Option<DateTime<Utc>>,
    /// Whether the node currently reports a `Ready=True` condition.
    pub ready: bool,
    /// Current annotations, including any remediation state.
    pub annotations: BTreeMap<String, String>,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
            created_at: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
            ready: node_is_ready(node),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
        }
    }
}

/// A node is ready iff a `Ready` condition is present with status `True`.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Read access to the current set of cluster nodes.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// List all nodes in the cluster.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, K8sError>;
}

/// Write access to per-node annotations.
///
/// Each call is a single server-side patch; there is no local caching and no
/// optimistic concurrency token. Last writer wins, which is acceptable with a
/// single controller instance per cluster.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Set one annotation on a node, creating or overwriting it.
    async fn set_annotation(&self, node: &str, key: &str, value: &str) -> Result<(), K8sError>;

    /// Remove one annotation from a node.
    async fn delete_annotation(&self, node: &str, key: &str) -> Result<(), K8sError>;
}

/// Kubernetes-backed implementation of both node contracts.
#[derive(Clone)]
pub struct KubeNodes {
    nodes: Api<Node>,
}

impl KubeNodes {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }

    /// Merge-patch `metadata.annotations` with a single key. A `null` value
    /// deletes the key.
    async fn patch_annotation(
        &self,
        node: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), K8sError> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), value);
        let patch = json!({ "metadata": { "annotations": annotations } });

        debug!(node = %node, key = %key, "patching node annotations");

        self.nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| K8sError::Patch {
                node: node.to_string(),
                source: e,
            })?;

        Ok(())
    }
}

#[async_trait]
impl NodeInventory for KubeNodes {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, K8sError> {
        let nodes = self
            .nodes
            .list(&ListParams::default())
            .await
            .map_err(K8sError::List)?;

        Ok(nodes.items.iter().map(NodeInfo::from).collect())
    }
}

#[async_trait]
impl AnnotationStore for KubeNodes {
    async fn set_annotation(&self, node: &str, key: &str, value: &str) -> Result<(), K8sError> {
        self.patch_annotation(node, key, serde_json::Value::String(value.to_string()))
            .await
    }

    async fn delete_annotation(&self, node: &str, key: &str) -> Result<(), K8sError> {
        self.patch_annotation(node, key, serde_json::Value::Null)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node_with_conditions(conditions: Vec<NodeCondition>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_condition_true() {
        let node = node_with_conditions(vec![
            condition("MemoryPressure", "False"),
            condition("Ready", "True"),
        ]);
        assert!(node_is_ready(&node));
    }

    #[test]
    fn test_ready_condition_false() {
        let node = node_with_conditions(vec![condition("Ready", "False")]);
        assert!(!node_is_ready(&node));
    }

    #[test]
    fn test_ready_condition_unknown() {
        let node = node_with_conditions(vec![condition("Ready", "Unknown")]);
        assert!(!node_is_ready(&node));
    }

    #[test]
    fn test_no_conditions_means_not_ready() {
        assert!(!node_is_ready(&Node::default()));
        assert!(!node_is_ready(&node_with_conditions(vec![])));
    }

    #[test]
    fn test_node_info_snapshot() {
        let created = Utc::now();
        let mut annotations = BTreeMap::new();
        annotations.insert("node-medic/last-reboot".to_string(), "x".to_string());

        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                creation_timestamp: Some(Time(created)),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("hcloud://12345".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![condition("Ready", "True")]),
                ..Default::default()
            }),
        };

        let info = NodeInfo::from(&node);
        assert_eq!(info.name, "worker-1");
        assert_eq!(info.provider_id.as_deref(), Some("hcloud://12345"));
        assert_eq!(info.created_at, Some(created));
        assert!(info.ready);
        assert_eq!(info.annotations, annotations);
    }

    #[test]
    fn test_node_info_defaults_for_sparse_node() {
        let info = NodeInfo::from(&Node::default());
        assert_eq!(info.name, "");
        assert!(info.provider_id.is_none());
        assert!(info.created_at.is_none());
        assert!(!info.ready);
        assert!(info.annotations.is_empty());
    }
}
