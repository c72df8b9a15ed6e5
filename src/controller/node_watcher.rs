//! Reacts to nodes becoming end-of-life by queueing pod migrations

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::workers::{ClusterTask, MigrationTask, MigrationWorkers};
use crate::cluster::node_is_end_of_life;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::k8s::{pod_node_name, pod_role, ControlPlane, NamespacedName, PodRole};

/// How often the watcher checks whether leadership changed
const LEADERSHIP_POLL: Duration = Duration::from_secs(5);

/// Remembers the last end-of-life verdict per node
pub struct NodeTransitions {
    readiness_label: BTreeMap<String, String>,
    end_of_life: HashMap<String, bool>,
    leading: bool,
}

impl NodeTransitions {
    pub fn new(readiness_label: BTreeMap<String, String>) -> Self {
        Self {
            readiness_label,
            end_of_life: HashMap::new(),
            leading: false,
        }
    }

    /// Record the current state of `node`; true when it just turned
    /// end-of-life while leading.
    ///
    /// A node seen for the first time counts as a transition if it is already
    /// end-of-life, so pods left behind before a restart still get moved.
    /// Verdicts are recorded while following too; they are handed out by
    /// [`NodeTransitions::set_leading`] once leadership is gained.
    pub fn observe(&mut self, node: &Node) -> bool {
        let now = node_is_end_of_life(node, &self.readiness_label);
        let before = self.end_of_life.insert(node.name_any(), now);
        self.leading && now && before != Some(true)
    }

    /// Update leadership; on gaining it, returns every node currently
    /// end-of-life so their pods get moved.
    pub fn set_leading(&mut self, leading: bool) -> Vec<String> {
        let gained = leading && !self.leading;
        self.leading = leading;
        if !gained {
            return Vec::new();
        }

        let mut nodes: Vec<String> = self
            .end_of_life
            .iter()
            .filter(|(_, eol)| **eol)
            .map(|(name, _)| name.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn forget(&mut self, node: &Node) {
        self.end_of_life.remove(&node.name_any());
    }
}

/// Tasks moving the cluster pods off `node_name`, primaries first
pub fn plan_node_migrations(
    node_name: &str,
    pods: &[Pod],
    config: &OperatorConfig,
) -> Vec<ClusterTask> {
    let mut primaries = Vec::new();
    let mut replicas = Vec::new();

    for pod in pods.iter().filter(|p| pod_node_name(p) == Some(node_name)) {
        let Some(cluster_name) = pod.labels().get(&config.cluster_name_label) else {
            continue;
        };
        let name = NamespacedName::from_pod(pod);
        let cluster = NamespacedName::new(name.namespace.clone(), cluster_name.clone());

        match pod_role(pod, &config.pod_role_label) {
            Some(PodRole::Primary) => primaries.push(ClusterTask::new(
                cluster,
                MigrationTask::MigratePrimary(name),
            )),
            Some(PodRole::Replica) => replicas.push(ClusterTask::new(
                cluster,
                MigrationTask::MigrateReplica {
                    pod: name,
                    from_node: node_name.to_string(),
                },
            )),
            None => debug!("Pod {} has no role yet, leaving it on node {}", name, node_name),
        }
    }

    primaries.extend(replicas);
    primaries
}

/// List the cluster pods on `node_name` and queue their migration
#[instrument(skip(api, config, workers))]
pub async fn migrate_node(
    node_name: &str,
    api: &dyn ControlPlane,
    config: &OperatorConfig,
    workers: &MigrationWorkers,
) -> Result<usize> {
    let pods = api
        .list_all_pods(&config.all_clusters_selector(), Some(node_name))
        .await
        .map_err(|e| e.context(format!("could not list pods on node {node_name}")))?;

    let tasks = plan_node_migrations(node_name, &pods, config);
    let count = tasks.len();
    for task in tasks {
        workers.submit(task).await?;
    }
    Ok(count)
}

async fn queue_node(
    name: &str,
    api: &dyn ControlPlane,
    config: &OperatorConfig,
    workers: &MigrationWorkers,
) {
    match migrate_node(name, api, config, workers).await {
        Ok(count) => info!("Queued {} pod migrations from node {}", count, name),
        Err(e) => error!("Could not queue migrations from node {}: {}", name, e),
    }
}

/// Watch nodes and queue migrations while this replica holds the lease.
///
/// Nodes are tracked while following as well, so a replica that gains the
/// lease moves pods off every node that is end-of-life at that point.
pub async fn run_node_watcher(
    client: Client,
    api: Arc<dyn ControlPlane>,
    config: Arc<OperatorConfig>,
    workers: Arc<MigrationWorkers>,
    is_leader: Arc<AtomicBool>,
) {
    let nodes: Api<Node> = Api::all(client);
    let mut transitions = NodeTransitions::new(config.node_readiness_label.clone());
    let mut stream = watcher(nodes, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut leadership = tokio::time::interval(LEADERSHIP_POLL);

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                let node = match item {
                    Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => node,
                    Ok(watcher::Event::Delete(node)) => {
                        transitions.forget(&node);
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Node watch error: {}", e);
                        continue;
                    }
                };

                if transitions.observe(&node) {
                    let name = node.name_any();
                    info!("Node {} became end-of-life, moving cluster pods off it", name);
                    queue_node(&name, api.as_ref(), &config, &workers).await;
                }
            }
            _ = leadership.tick() => {
                let gained = transitions.set_leading(is_leader.load(Ordering::Relaxed));
                if !gained.is_empty() {
                    info!("Became leader with {} end-of-life nodes", gained.len());
                }
                for name in gained {
                    queue_node(&name, api.as_ref(), &config, &workers).await;
                }
            }
        }
    }
    warn!("Node watch stream ended");
}
