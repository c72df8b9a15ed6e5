//! Switchover candidate selection and retried Patroni queries

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, instrument};

use super::Cluster;
use crate::error::{Error, Result};
use crate::k8s::NamespacedName;
use crate::patroni::{
    ClusterMember, MemberData, MemberRole, PatroniConfig, STATE_CREATING_REPLICA, STATE_RUNNING,
};

/// Pick the member a primary should be switched over to.
///
/// Leaders and members that are not running are never eligible. When any
/// synchronous standby is eligible, synchronous replication is assumed and
/// only those are considered. Within the chosen set the lowest lag wins;
/// equal lags keep the order reported by Patroni.
pub fn pick_switchover_candidate(members: &[ClusterMember]) -> Option<&ClusterMember> {
    let eligible: Vec<&ClusterMember> = members
        .iter()
        .filter(|m| !m.role.is_leader() && m.state == STATE_RUNNING)
        .collect();

    let sync: Vec<&ClusterMember> = eligible
        .iter()
        .copied()
        .filter(|m| m.role == MemberRole::SyncStandby)
        .collect();

    let pool = if sync.is_empty() { eligible } else { sync };
    pool.into_iter().min_by_key(|m| m.lag)
}

impl Cluster {
    /// Choose the replica `primary` should fail over to
    #[instrument(skip(self, primary), fields(pod = %NamespacedName::from_pod(primary)))]
    pub async fn get_switchover_candidate(&self, primary: &Pod) -> Result<NamespacedName> {
        let patroni = &self.ctx.patroni;
        let members = self
            .config()
            .patroni_api_retry()
            .retry("get Patroni cluster members", || {
                patroni.get_cluster_members(primary)
            })
            .await
            .map_err(|e| e.context("failed to get Patroni cluster members"))?;

        let candidate = pick_switchover_candidate(&members).ok_or(Error::NoSwitchoverCandidate)?;
        debug!(
            "Selected switchover candidate {} (role {}, lag {})",
            candidate.name, candidate.role, candidate.lag
        );

        Ok(NamespacedName::new(
            NamespacedName::from_pod(primary).namespace,
            candidate.name.clone(),
        ))
    }

    /// Patroni dynamic configuration and PostgreSQL parameters of `pod`
    pub async fn get_patroni_config(
        &self,
        pod: &Pod,
    ) -> Result<(PatroniConfig, BTreeMap<String, String>)> {
        let patroni = &self.ctx.patroni;
        self.config()
            .patroni_api_retry()
            .retry("get Patroni config", || patroni.get_config(pod))
            .await
            .map_err(|e| {
                e.context(format!(
                    "could not get Postgres config from pod {}",
                    NamespacedName::from_pod(pod)
                ))
            })
    }

    /// Patroni member data of `pod`; fails while the replica is still being created
    pub async fn get_member_data(&self, pod: &Pod) -> Result<MemberData> {
        let patroni = &self.ctx.patroni;
        let data = self
            .config()
            .patroni_api_retry()
            .retry("get Patroni member data", || patroni.get_member_data(pod))
            .await
            .map_err(|e| e.context("could not get member data"))?;

        if data.state == STATE_CREATING_REPLICA {
            return Err(Error::MemberInitializing);
        }
        Ok(data)
    }
}
