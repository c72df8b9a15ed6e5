//! End-of-life node detection

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use super::Cluster;
use crate::error::{Error, Result};
use crate::k8s::{labels_contain, pod_node_name, NamespacedName};

/// A node is end-of-life when it is cordoned or lacks the readiness labels
pub fn node_is_end_of_life(node: &Node, readiness_label: &BTreeMap<String, String>) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    unschedulable || !labels_contain(node.labels(), readiness_label)
}

impl Cluster {
    /// Check whether the node `pod` runs on should no longer host workloads.
    ///
    /// Fails only when the node cannot be looked up.
    pub async fn is_end_of_life(&self, pod: &Pod) -> Result<bool> {
        let node_name = pod_node_name(pod).ok_or_else(|| {
            Error::PreconditionFailed(format!(
                "pod {} is not scheduled on any node",
                NamespacedName::from_pod(pod)
            ))
        })?;

        let node = self
            .ctx
            .api
            .get_node(node_name)
            .await
            .map_err(|e| e.context(format!("could not get node {node_name:?}")))?;

        Ok(node_is_end_of_life(&node, &self.config().node_readiness_label))
    }
}
