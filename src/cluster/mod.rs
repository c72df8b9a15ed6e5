//! Pod lifecycle and failover coordination for a single PostgreSQL cluster
//!
//! A [`Cluster`] is owned by exactly one migration worker, so its operations
//! never run concurrently for the same cluster. Waiting for externally driven
//! pod deletion and recreation goes through the shared [`PodEventBus`].

mod eol;
mod events;
mod migration;
mod pods;
mod rolling_update;
mod switchover;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;

pub use eol::node_is_end_of_life;
pub use events::{
    wait_for_pod_deletion, wait_for_pod_label, PodEvent, PodEventBus, PodEventType,
    PodSubscription,
};
pub use rolling_update::{parse_bool_flag, rolling_update_flag, rolling_update_flag_patch};
pub use switchover::pick_switchover_candidate;

use crate::config::OperatorConfig;
use crate::k8s::{label_selector, ControlPlane, NamespacedName, PodRole};
use crate::patroni::{Coordinator, FailoverExecutor};

/// Collaborators shared by every cluster handled by the operator
#[derive(Clone)]
pub struct ClusterContext {
    pub config: Arc<OperatorConfig>,
    pub api: Arc<dyn ControlPlane>,
    pub patroni: Arc<dyn Coordinator>,
    pub failover: Arc<dyn FailoverExecutor>,
    pub events: Arc<PodEventBus>,
}

/// A PostgreSQL cluster, identified by namespace and cluster name
pub struct Cluster {
    name: NamespacedName,
    ctx: ClusterContext,
    /// Fetched once per cluster instance and reused afterwards
    stateful_set: Option<StatefulSet>,
}

impl Cluster {
    pub fn new(name: NamespacedName, ctx: ClusterContext) -> Self {
        Self {
            name,
            ctx,
            stateful_set: None,
        }
    }

    pub fn name(&self) -> &NamespacedName {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.name.namespace
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.ctx.config
    }

    /// The StatefulSet backing the cluster carries the cluster name
    fn stateful_set_name(&self) -> NamespacedName {
        self.name.clone()
    }

    fn labels_set(&self) -> BTreeMap<String, String> {
        let mut labels = self.config().cluster_labels.clone();
        labels.insert(
            self.config().cluster_name_label.clone(),
            self.name.name.clone(),
        );
        labels
    }

    /// Selector for every pod of this cluster
    fn cluster_selector(&self) -> String {
        label_selector(&self.labels_set())
    }

    /// Selector for the pods of this cluster holding `role`
    fn role_selector(&self, role: PodRole) -> String {
        let values = role.label_values();
        let role_part = if values.len() == 1 {
            format!("{}={}", self.config().pod_role_label, values[0])
        } else {
            format!("{} in ({})", self.config().pod_role_label, values.join(","))
        };
        format!("{},{}", self.cluster_selector(), role_part)
    }
}
