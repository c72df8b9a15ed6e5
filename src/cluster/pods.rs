//! Pod queries and delete/recreate primitives for a cluster

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use super::events::{wait_for_pod_deletion, wait_for_pod_label, PodEventBus, PodSubscription};
use super::Cluster;
use crate::error::{Error, Result};
use crate::k8s::{NamespacedName, PodRole};

/// Unsubscribes from the pod when dropped, so an abandoned wait does not
/// leave the pod subscribed
struct SubscriptionGuard<'a> {
    events: &'a PodEventBus,
    pod_name: NamespacedName,
    released: bool,
}

impl<'a> SubscriptionGuard<'a> {
    fn new(events: &'a PodEventBus, pod_name: &NamespacedName) -> Self {
        Self {
            events,
            pod_name: pod_name.clone(),
            released: false,
        }
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        self.events.unsubscribe(&self.pod_name)
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.events.unsubscribe(&self.pod_name) {
            warn!("Could not release abandoned subscription: {}", e);
        }
    }
}

impl Cluster {
    /// All pods of the cluster
    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.ctx
            .api
            .list_pods(self.namespace(), &self.cluster_selector())
            .await
            .map_err(|e| e.context("could not get list of pods"))
    }

    /// Pods of the cluster holding `role`; more than one primary is an error
    pub async fn get_role_pods(&self, role: PodRole) -> Result<Vec<Pod>> {
        let pods = self
            .ctx
            .api
            .list_pods(self.namespace(), &self.role_selector(role))
            .await
            .map_err(|e| e.context("could not get list of pods"))?;

        if role == PodRole::Primary && pods.len() > 1 {
            return Err(Error::TooManyPrimaries(pods.len()));
        }
        Ok(pods)
    }

    /// Delete every pod of the cluster; individual failures are only logged
    pub async fn delete_pods(&self) -> Result<()> {
        debug!("Deleting pods");
        let pods = self.list_pods().await?;

        for pod in &pods {
            let name = NamespacedName::from_pod(pod);
            debug!("Deleting pod {}", name);
            match self.delete_pod(&name).await {
                Ok(()) => info!("Pod {} has been deleted", name),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("Could not delete pod {}: {}", name, e),
            }
        }

        if pods.is_empty() {
            debug!("No pods to delete");
        } else {
            debug!("Pods have been deleted");
        }
        Ok(())
    }

    /// Delete a pod and wait until the deletion is observed
    #[instrument(skip(self), fields(pod = %name))]
    pub async fn delete_pod(&self, name: &NamespacedName) -> Result<()> {
        let mut sub = self.ctx.events.subscribe(name)?;
        let guard = SubscriptionGuard::new(&self.ctx.events, name);

        let result = async {
            self.ctx.api.delete_pod(name).await?;
            wait_for_pod_deletion(&mut sub, self.config().pod_deletion_wait_timeout).await
        }
        .await;

        guard.release()?;
        result
    }

    /// Delete a pod and wait for its replacement to come back with a role label
    #[instrument(skip(self), fields(pod = %name))]
    pub async fn recreate_pod(&self, name: &NamespacedName) -> Result<Pod> {
        let mut sub = self.ctx.events.subscribe(name)?;
        let guard = SubscriptionGuard::new(&self.ctx.events, name);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let result = self.await_recreation(name, &mut sub, &mut cancel_rx).await;

        drop(cancel_tx);
        guard.release()?;

        let pod = result?;
        info!("Pod {} has been recreated", name);
        Ok(pod)
    }

    async fn await_recreation(
        &self,
        name: &NamespacedName,
        sub: &mut PodSubscription,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<Pod> {
        let api = &self.ctx.api;
        self.config()
            .pod_api_retry()
            .retry("delete pod", || api.delete_pod(name))
            .await
            .map_err(|e| e.context("could not delete pod"))?;

        // The deletion must be observed first so the old pod's final events
        // are not mistaken for the replacement
        wait_for_pod_deletion(sub, self.config().pod_deletion_wait_timeout).await?;
        wait_for_pod_label(
            sub,
            cancel,
            &self.config().pod_role_label,
            None,
            self.config().pod_label_wait_timeout,
        )
        .await
    }
}
