//! Control-plane operations consumed by the migration core

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    Client,
};
use serde_json::Value;
use tracing::debug;

use super::NamespacedName;
use crate::error::Result;

/// Field manager used for every patch the operator issues
pub const FIELD_MANAGER: &str = "pgcluster-operator";

/// The subset of the Kubernetes API the migration core needs
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_pod(&self, name: &NamespacedName) -> Result<Pod>;

    /// List pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// List pods across every namespace, optionally restricted to one node
    async fn list_all_pods(&self, label_selector: &str, node_name: Option<&str>) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, name: &NamespacedName) -> Result<()>;

    /// Apply a JSON merge patch to a pod
    async fn patch_pod(&self, name: &NamespacedName, patch: &Value) -> Result<Pod>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn get_stateful_set(&self, name: &NamespacedName) -> Result<StatefulSet>;
}

/// [`ControlPlane`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_pod(&self, name: &NamespacedName) -> Result<Pod> {
        Ok(self.pods(&name.namespace).get(&name.name).await?)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        let pods = self.pods(namespace).list(&params).await?;
        Ok(pods.items)
    }

    async fn list_all_pods(&self, label_selector: &str, node_name: Option<&str>) -> Result<Vec<Pod>> {
        let mut params = ListParams::default().labels(label_selector);
        if let Some(node) = node_name {
            params = params.fields(&format!("spec.nodeName={node}"));
        }
        let pods: Api<Pod> = Api::all(self.client.clone());
        Ok(pods.list(&params).await?.items)
    }

    async fn delete_pod(&self, name: &NamespacedName) -> Result<()> {
        debug!("Deleting pod {}", name);
        self.pods(&name.namespace)
            .delete(&name.name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_pod(&self, name: &NamespacedName, patch: &Value) -> Result<Pod> {
        Ok(self
            .pods(&name.namespace)
            .patch(
                &name.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }

    async fn get_stateful_set(&self, name: &NamespacedName) -> Result<StatefulSet> {
        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &name.namespace);
        Ok(sets.get(&name.name).await?)
    }
}
