//! Moving pods off end-of-life nodes and rolling recreation of pod sets
//!
//! Every operation here is safe to re-enter: a pod that already moved or
//! changed role is skipped, and partial progress is never rolled back.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::Cluster;
use crate::error::{Error, Result};
use crate::k8s::{pod_node_name, pod_role, NamespacedName, PodRole};

impl Cluster {
    /// Recreate `pod` on another node if its node is end-of-life.
    ///
    /// Returns the pod unchanged when its node is still live. Fails if the
    /// replacement lands on the same node. Landing on another end-of-life
    /// node only logs a warning.
    #[instrument(skip(self, pod), fields(pod = %NamespacedName::from_pod(&pod)))]
    pub async fn move_pod_from_end_of_life_node(&self, pod: Pod) -> Result<Pod> {
        let name = NamespacedName::from_pod(&pod);
        let old_node = pod_node_name(&pod).unwrap_or_default().to_string();

        if !self.is_end_of_life(&pod).await? {
            info!("Check failed: pod {} is already on a live node", name);
            return Ok(pod);
        }

        info!("Moving pod {} out of the end-of-life node {}", name, old_node);
        let new_pod = self
            .recreate_pod(&name)
            .await
            .map_err(|e| e.context("could not move pod"))?;

        let new_node = pod_node_name(&new_pod).unwrap_or_default().to_string();
        if new_node == old_node {
            return Err(Error::PodRemainedOnNode {
                pod: name.to_string(),
                node: old_node,
            });
        }

        if self.is_end_of_life(&new_pod).await? {
            warn!("Pod {} moved to end-of-life node {}", name, new_node);
            return Ok(new_pod);
        }

        info!("Pod {} moved from node {} to node {}", name, old_node, new_node);
        Ok(new_pod)
    }

    /// Move the primary off an end-of-life node, switching over to a replica first
    #[instrument(skip(self), fields(cluster = %self.name()))]
    pub async fn migrate_primary_pod(&mut self, name: &NamespacedName) -> Result<()> {
        self.migrate_primary_pod_inner(name)
            .await
            .map_err(|e| e.context(format!("could not migrate primary pod {name}")))
    }

    async fn migrate_primary_pod_inner(&mut self, name: &NamespacedName) -> Result<()> {
        let old_primary = self
            .ctx
            .api
            .get_pod(name)
            .await
            .map_err(|e| e.context("could not get pod"))?;

        info!("Starting process to migrate primary pod {}", name);

        if !self.is_end_of_life(&old_primary).await? {
            debug!("No action needed: primary pod is already on a live node");
            return Ok(());
        }

        if pod_role(&old_primary, &self.config().pod_role_label) != Some(PodRole::Primary) {
            warn!("No action needed: pod {} is not the primary (anymore)", name);
            return Ok(());
        }

        let replicas = self.desired_replicas().await?;
        let candidate_name = if replicas > 1 {
            Some(
                self.get_switchover_candidate(&old_primary)
                    .await
                    .map_err(|e| {
                        e.context("could not find suitable replica pod as candidate for failover")
                    })?,
            )
        } else {
            warn!(
                "Migrating single pod cluster {}, this will cause downtime of the Postgres cluster until pod is back",
                self.name()
            );
            None
        };

        let candidate_pod = match &candidate_name {
            Some(candidate) => match self.ctx.api.get_pod(candidate).await {
                Ok(pod) => Some(pod),
                // A vanished candidate is handled like a cluster without replicas
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Switchover candidate {} not found, moving primary without failover",
                        candidate
                    );
                    None
                }
                Err(e) => return Err(e.context("could not get primary candidate pod")),
            },
            None => None,
        };

        // Without a candidate the only option is to recreate the primary
        let (Some(candidate_name), Some(candidate_pod)) = (candidate_name, candidate_pod) else {
            self.move_pod_from_end_of_life_node(old_primary)
                .await
                .map_err(|e| e.context("could not move pod"))?;
            return Ok(());
        };

        // A candidate on a doomed node is moved before it gets promoted
        self.move_pod_from_end_of_life_node(candidate_pod)
            .await
            .map_err(|e| e.context("could not move pod"))?;

        let failover = &self.ctx.failover;
        self.config()
            .failover_retry()
            .retry_until("switchover", || async {
                match failover.switchover(&old_primary, &candidate_name).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        error!("Could not failover to pod {}: {}", candidate_name, e);
                        Ok(false)
                    }
                }
            })
            .await
    }

    /// Recreate a replica that is still on `from_node`
    #[instrument(skip(self), fields(cluster = %self.name()))]
    pub async fn migrate_replica_pod(&self, name: &NamespacedName, from_node: &str) -> Result<()> {
        let replica = self
            .ctx
            .api
            .get_pod(name)
            .await
            .map_err(|e| e.context("could not get pod"))?;

        info!("Migrating replica pod {} to live node", name);

        let current_node = pod_node_name(&replica).unwrap_or_default();
        if current_node != from_node {
            info!(
                "Check failed: pod {} has already migrated to node {}",
                name, current_node
            );
            return Ok(());
        }

        if pod_role(&replica, &self.config().pod_role_label) != Some(PodRole::Replica) {
            return Err(Error::PreconditionFailed(format!(
                "pod {name} is not a replica"
            )));
        }

        self.move_pod_from_end_of_life_node(replica)
            .await
            .map_err(|e| e.context("could not move pod"))?;
        Ok(())
    }

    /// Recreate `pods`, replicas first and the primary last.
    ///
    /// `switchover_candidates` lists replicas known to be eligible even if
    /// none of `pods` is recreated as a replica. Unless a new primary shows up
    /// among the recreated pods, the old primary is switched over before it
    /// is recreated itself.
    #[instrument(skip_all, fields(cluster = %self.name(), pods = pods.len()))]
    pub async fn recreate_pods(
        &self,
        pods: &[Pod],
        switchover_candidates: &[NamespacedName],
    ) -> Result<()> {
        info!("There are {} pods in the cluster to recreate", pods.len());

        let role_label = &self.config().pod_role_label;
        let mut primary_pod: Option<&Pod> = None;
        let mut new_primary_pod: Option<Pod> = None;
        let mut replicas: Vec<NamespacedName> = switchover_candidates.to_vec();

        for pod in pods {
            if pod_role(pod, role_label) == Some(PodRole::Primary) {
                if primary_pod.is_some() {
                    return Err(Error::TooManyPrimaries(2));
                }
                primary_pod = Some(pod);
                continue;
            }

            let name = NamespacedName::from_pod(pod);
            let new_pod = self
                .recreate_pod(&name)
                .await
                .map_err(|e| e.context(format!("could not recreate replica pod {name}")))?;

            match pod_role(&new_pod, role_label) {
                Some(PodRole::Replica) => replicas.push(name),
                Some(PodRole::Primary) => {
                    warn!("Pod {} came back as primary during recreation", name);
                    new_primary_pod = Some(new_pod);
                }
                None => {}
            }
        }

        let Some(primary_pod) = primary_pod else {
            return Ok(());
        };
        let primary_name = NamespacedName::from_pod(primary_pod);

        match (&new_primary_pod, replicas.is_empty()) {
            (None, false) => {
                // Without a switchover the primary keeps its flag and is retried on the next pass
                let candidate = self
                    .get_switchover_candidate(primary_pod)
                    .await
                    .map_err(|e| e.context("skipping switchover"))?;
                self.ctx
                    .failover
                    .switchover(primary_pod, &candidate)
                    .await
                    .map_err(|e| e.context("could not perform switch over"))?;
            }
            (None, true) => {
                warn!("Cannot perform switch over before re-creating the pod: no replicas");
            }
            (Some(new_primary), _) => {
                info!(
                    "Skipping switchover, {} is already the new primary",
                    new_primary.name_any()
                );
            }
        }

        info!("Recreating old primary pod {}", primary_name);
        self.recreate_pod(&primary_name)
            .await
            .map_err(|e| e.context(format!("could not recreate old primary pod {primary_name}")))?;
        Ok(())
    }

    /// Recreate every pod still carrying the rolling update flag
    #[instrument(skip(self), fields(cluster = %self.name()))]
    pub async fn rolling_update(&self) -> Result<()> {
        let flagged: Vec<Pod> = self
            .list_pods()
            .await?
            .into_iter()
            .filter(|pod| self.get_rolling_update_flag(pod))
            .collect();

        if flagged.is_empty() {
            debug!("No pods require a rolling update");
            return Ok(());
        }
        self.recreate_pods(&flagged, &[]).await
    }

    /// Desired replica count of the cluster StatefulSet, fetched once
    async fn desired_replicas(&mut self) -> Result<i32> {
        if self.stateful_set.is_none() {
            let name = self.stateful_set_name();
            let sts = self
                .ctx
                .api
                .get_stateful_set(&name)
                .await
                .map_err(|e| e.context("could not retrieve cluster statefulset"))?;
            self.stateful_set = Some(sts);
        }

        Ok(self
            .stateful_set
            .as_ref()
            .and_then(|sts| sts.spec.as_ref())
            .and_then(|spec| spec.replicas)
            .unwrap_or(1))
    }
}
