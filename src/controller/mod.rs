//! Operator runtime
//!
//! Wires the watchers, the migration worker pool, the periodic resync and
//! leader election around the per-cluster migration logic.

mod leader;
mod node_watcher;
mod pod_watcher;
mod resync;
mod workers;

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use leader::{lease_expired, LeaderElector, LEASE_NAME};
pub use node_watcher::{migrate_node, plan_node_migrations, run_node_watcher, NodeTransitions};
pub use pod_watcher::{run_pod_watcher, PodEventTranslator};
pub use resync::{clusters_needing_rolling_update, resync_once, run_resync};
pub use workers::{process_task, worker_index, ClusterTask, MigrationTask, MigrationWorkers};

use crate::cluster::{ClusterContext, PodEventBus};
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::k8s::{ControlPlane, KubeControlPlane};
use crate::patroni::PatroniClient;

/// Where the operator takes part in leader election
#[derive(Clone, Debug)]
pub struct LeaderElectionSettings {
    pub namespace: String,
    pub identity: String,
}

/// Build the collaborators shared by every cluster from a live client
pub fn cluster_context(client: Client, config: Arc<OperatorConfig>) -> Result<ClusterContext> {
    let patroni = Arc::new(PatroniClient::new(
        config.patroni_api_port,
        config.patroni_api_check_timeout,
    )?);
    let api: Arc<dyn ControlPlane> = Arc::new(KubeControlPlane::new(client));

    Ok(ClusterContext {
        config,
        api,
        patroni: patroni.clone(),
        failover: patroni,
        events: Arc::new(PodEventBus::new()),
    })
}

/// Run the operator until SIGINT or SIGTERM
pub async fn run_operator(
    client: Client,
    config: Arc<OperatorConfig>,
    election: LeaderElectionSettings,
) -> Result<()> {
    let ctx = cluster_context(client.clone(), config.clone())?;
    let elector = LeaderElector::new(client.clone(), &election.namespace, &election.identity);
    let is_leader = elector.is_leader();
    let workers = Arc::new(MigrationWorkers::start(ctx.clone(), config.workers));

    info!("Starting pgcluster operator");
    // Sources of new migrations
    let producers: Vec<JoinHandle<()>> = vec![
        tokio::spawn(run_node_watcher(
            client.clone(),
            ctx.api.clone(),
            config.clone(),
            workers.clone(),
            is_leader.clone(),
        )),
        tokio::spawn(run_resync(
            ctx.api.clone(),
            config.clone(),
            workers.clone(),
            is_leader,
        )),
    ];
    // Running migrations depend on these until they finish
    let feeders: Vec<JoinHandle<()>> = vec![
        tokio::spawn(run_pod_watcher(client, config, ctx.events.clone())),
        tokio::spawn(elector.run()),
    ];

    shutdown_signal().await;
    info!("Shutting down, waiting for running migrations");
    stop_in_order(producers, workers, feeders).await;
    Ok(())
}

/// Stop the operator tasks without stranding a migration.
///
/// Producers are stopped first and queued migrations are drained while the
/// pod watcher still feeds the event bus and the lease is still held.
pub async fn stop_in_order(
    producers: Vec<JoinHandle<()>>,
    workers: Arc<MigrationWorkers>,
    feeders: Vec<JoinHandle<()>>,
) {
    for task in producers {
        task.abort();
        let _ = task.await;
    }
    match Arc::try_unwrap(workers) {
        Ok(workers) => workers.shutdown().await,
        Err(_) => warn!("Migration workers still referenced, not waiting for them"),
    }
    for task in feeders {
        task.abort();
        let _ = task.await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::testing::{make_pod, Harness};
    use crate::cluster::{PodEvent, PodEventType};
    use crate::k8s::{NamespacedName, PodRole};

    #[tokio::test(start_paused = true)]
    async fn test_running_migration_finishes_during_shutdown() {
        let harness = Harness::new();
        harness.add_pod("acid-test-1", "old-node", PodRole::Replica);
        // The replacement only gets its role label through the watcher
        harness.api.place("acid-test-1", "live-node", None);
        let workers = Arc::new(MigrationWorkers::start(harness.context(), 1));

        let events = harness.events.clone();
        let pod_watcher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let pod = make_pod("acid-test-1", "live-node", Some(PodRole::Replica));
                events.publish(PodEvent::new(PodEventType::Update, None, pod)).await;
            }
        });
        let node_watcher = tokio::spawn(std::future::pending::<()>());

        workers
            .submit(ClusterTask::new(
                NamespacedName::new("default", "acid-test"),
                MigrationTask::MigrateReplica {
                    pod: NamespacedName::new("default", "acid-test-1"),
                    from_node: "old-node".to_string(),
                },
            ))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        stop_in_order(vec![node_watcher], workers, vec![pod_watcher]).await;

        assert!(started.elapsed() < harness.config.pod_label_wait_timeout);
        assert_eq!(harness.operations(), vec!["delete acid-test-1".to_string()]);
        // Nothing failed, so nothing was flagged
        assert_eq!(harness.api.patch_count(), 0);
    }
}
