//! Periodic sweep for pods still flagged for rolling update

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::workers::{ClusterTask, MigrationTask, MigrationWorkers};
use crate::cluster::rolling_update_flag;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::k8s::{ControlPlane, NamespacedName};

/// Clusters owning at least one flagged pod
pub fn clusters_needing_rolling_update(
    pods: &[Pod],
    config: &OperatorConfig,
) -> BTreeSet<NamespacedName> {
    pods.iter()
        .filter(|pod| rolling_update_flag(pod, &config.rolling_update_annotation))
        .filter_map(|pod| {
            let cluster = pod.labels().get(&config.cluster_name_label)?;
            Some(NamespacedName::new(
                NamespacedName::from_pod(pod).namespace,
                cluster.clone(),
            ))
        })
        .collect()
}

/// Queue a rolling update for every cluster with flagged pods
pub async fn resync_once(
    api: &dyn ControlPlane,
    config: &OperatorConfig,
    workers: &MigrationWorkers,
) -> Result<usize> {
    let selector = config.all_clusters_selector();
    let pods = match &config.watched_namespace {
        Some(ns) => api.list_pods(ns, &selector).await,
        None => api.list_all_pods(&selector, None).await,
    }
    .map_err(|e| e.context("could not list cluster pods"))?;

    let clusters = clusters_needing_rolling_update(&pods, config);
    for cluster in &clusters {
        workers
            .submit(ClusterTask::new(cluster.clone(), MigrationTask::RollingUpdate))
            .await?;
    }
    Ok(clusters.len())
}

/// Run [`resync_once`] every `resync_period` while holding the lease
pub async fn run_resync(
    api: Arc<dyn ControlPlane>,
    config: Arc<OperatorConfig>,
    workers: Arc<MigrationWorkers>,
    is_leader: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(config.resync_period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if !is_leader.load(Ordering::Relaxed) {
            continue;
        }
        match resync_once(api.as_ref(), &config, &workers).await {
            Ok(0) => debug!("No cluster needs a rolling update"),
            Ok(n) => info!("Queued rolling update for {} clusters", n),
            Err(e) => error!("Resync failed: {}", e),
        }
    }
}
