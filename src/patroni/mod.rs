//! Patroni integration
//!
//! Patroni is the HA coordinator running next to PostgreSQL in every pod. It
//! reports member roles, states and replication lag, and performs the actual
//! promotion during a switchover.

pub mod client;
pub mod error;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

pub use client::PatroniClient;
pub use error::PatroniError;
pub use types::{
    ClusterMember, MemberData, MemberRole, PatroniConfig, STATE_CREATING_REPLICA, STATE_RUNNING,
    UNKNOWN_LAG,
};

use crate::error::Result;
use crate::k8s::NamespacedName;

/// Read access to the HA coordinator
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Dynamic configuration and the PostgreSQL parameters it carries
    async fn get_config(&self, pod: &Pod) -> Result<(PatroniConfig, BTreeMap<String, String>)>;

    /// State of the member running in `pod`
    async fn get_member_data(&self, pod: &Pod) -> Result<MemberData>;

    /// Every member of the cluster `pod` belongs to
    async fn get_cluster_members(&self, pod: &Pod) -> Result<Vec<ClusterMember>>;
}

/// Performs the promotion of a replica over the current primary.
///
/// Implementations block until the new role is durably observed or fail.
#[async_trait]
pub trait FailoverExecutor: Send + Sync {
    async fn switchover(&self, primary: &Pod, candidate: &NamespacedName) -> Result<()>;
}
