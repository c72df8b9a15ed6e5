//! Migration worker pool
//!
//! Each cluster is pinned to one worker by hashing its name, so tasks for the
//! same cluster run strictly one after another while different clusters are
//! handled in parallel. A worker owns the [`Cluster`] instances it serves.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{Cluster, ClusterContext};
use crate::error::{Error, Result};
use crate::k8s::NamespacedName;

/// Queued tasks per worker before submitters wait
const WORKER_QUEUE: usize = 256;

/// Work item for a single cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationTask {
    /// Move the primary off its end-of-life node, switching over first
    MigratePrimary(NamespacedName),
    /// Move a replica off `from_node`
    MigrateReplica {
        pod: NamespacedName,
        from_node: String,
    },
    /// Recreate every pod of the cluster carrying the rolling update flag
    RollingUpdate,
}

impl MigrationTask {
    /// Pod the task is about, if any
    pub fn pod(&self) -> Option<&NamespacedName> {
        match self {
            MigrationTask::MigratePrimary(pod) | MigrationTask::MigrateReplica { pod, .. } => {
                Some(pod)
            }
            MigrationTask::RollingUpdate => None,
        }
    }
}

impl fmt::Display for MigrationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTask::MigratePrimary(pod) => write!(f, "migrate primary {pod}"),
            MigrationTask::MigrateReplica { pod, from_node } => {
                write!(f, "migrate replica {pod} from {from_node}")
            }
            MigrationTask::RollingUpdate => write!(f, "rolling update"),
        }
    }
}

/// A task addressed to a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTask {
    pub cluster: NamespacedName,
    pub task: MigrationTask,
}

impl ClusterTask {
    pub fn new(cluster: NamespacedName, task: MigrationTask) -> Self {
        Self { cluster, task }
    }
}

/// Index of the worker serving `cluster` among `workers`
pub fn worker_index(cluster: &NamespacedName, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    cluster.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Run `task` against `cluster`.
///
/// When a pod migration fails the pod is flagged for rolling update, so the
/// periodic resync retries it later.
#[instrument(skip(cluster, task), fields(cluster = %cluster.name(), task = %task))]
pub async fn process_task(cluster: &mut Cluster, task: &MigrationTask) -> Result<()> {
    let result = match task {
        MigrationTask::MigratePrimary(pod) => cluster.migrate_primary_pod(pod).await,
        MigrationTask::MigrateReplica { pod, from_node } => {
            cluster.migrate_replica_pod(pod, from_node).await
        }
        MigrationTask::RollingUpdate => cluster.rolling_update().await,
    };

    if let Err(e) = &result {
        error!("Task {} failed: {}", task, e);
        if let Some(pod) = task.pod() {
            if let Err(flag_err) = cluster.flag_pod_for_rolling_update(pod, &e.to_string()).await {
                warn!("Could not flag pod {} for rolling update: {}", pod, flag_err);
            }
        }
    }
    result
}

async fn run_worker(id: usize, ctx: ClusterContext, mut tasks: mpsc::Receiver<ClusterTask>) {
    let mut clusters: HashMap<NamespacedName, Cluster> = HashMap::new();
    debug!("Migration worker {} started", id);

    while let Some(ClusterTask { cluster, task }) = tasks.recv().await {
        let cluster = clusters
            .entry(cluster.clone())
            .or_insert_with(|| Cluster::new(cluster, ctx.clone()));
        // Failures are logged and flagged; the worker keeps going
        let _ = process_task(cluster, &task).await;
    }

    debug!("Migration worker {} stopped", id);
}

/// Fixed pool of migration workers
pub struct MigrationWorkers {
    senders: Vec<mpsc::Sender<ClusterTask>>,
    handles: Vec<JoinHandle<()>>,
}

impl MigrationWorkers {
    /// Spawn `count` workers; at least one is always started
    pub fn start(ctx: ClusterContext, count: usize) -> Self {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(id, ctx.clone(), rx)));
        }

        info!("Started {} migration workers", count);
        Self { senders, handles }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue `task` on the worker owning its cluster
    pub async fn submit(&self, task: ClusterTask) -> Result<()> {
        let id = worker_index(&task.cluster, self.senders.len());
        debug!("Queueing {} for cluster {} on worker {}", task.task, task.cluster, id);
        self.senders[id]
            .send(task)
            .await
            .map_err(|_| Error::WorkerStopped(id))
    }

    /// Stop accepting tasks and wait until queued ones are done
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Migration worker panicked: {}", e);
            }
        }
    }
}
