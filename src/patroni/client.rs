//! HTTP client for the Patroni REST API running in every cluster pod

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use super::error::PatroniError;
use super::types::{ClusterMember, ClusterMembers, MemberData, PatroniConfig};
use super::{Coordinator, FailoverExecutor};
use crate::error::Result;
use crate::k8s::NamespacedName;

/// Client for querying Patroni members over HTTP
#[derive(Clone)]
pub struct PatroniClient {
    http_client: Client,
    port: u16,
}

impl PatroniClient {
    pub fn new(port: u16, timeout: Duration) -> std::result::Result<Self, PatroniError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pgcluster-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client, port })
    }

    fn base_url(&self, pod: &Pod) -> std::result::Result<String, PatroniError> {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| PatroniError::MissingPodIp(NamespacedName::from_pod(pod).to_string()))?;
        Ok(format!("http://{}:{}", ip, self.port))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        pod: &Pod,
        path: &str,
    ) -> std::result::Result<T, PatroniError> {
        let url = format!("{}{}", self.base_url(pod)?, path);
        debug!("Querying Patroni API {}", url);

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PatroniError::UnexpectedStatus {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| PatroniError::DecodeError(format!("{url}: {e}")))
    }
}

#[async_trait]
impl Coordinator for PatroniClient {
    async fn get_config(&self, pod: &Pod) -> Result<(PatroniConfig, BTreeMap<String, String>)> {
        let config: PatroniConfig = self.get_json(pod, "/config").await?;
        let parameters = config.pg_parameters();
        Ok((config, parameters))
    }

    async fn get_member_data(&self, pod: &Pod) -> Result<MemberData> {
        Ok(self.get_json(pod, "/patroni").await?)
    }

    async fn get_cluster_members(&self, pod: &Pod) -> Result<Vec<ClusterMember>> {
        let members: ClusterMembers = self.get_json(pod, "/cluster").await?;
        Ok(members.members)
    }
}

#[async_trait]
impl FailoverExecutor for PatroniClient {
    async fn switchover(&self, primary: &Pod, candidate: &NamespacedName) -> Result<()> {
        let url = format!("{}/switchover", self.base_url(primary)?);
        let leader = NamespacedName::from_pod(primary);
        info!("Switching over from {} to {}", leader, candidate);

        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "leader": leader.name,
                "candidate": candidate.name,
            }))
            .send()
            .await
            .map_err(PatroniError::from)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PatroniError::UnexpectedStatus {
                url,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        debug!("Switchover accepted: {}", body.trim());
        Ok(())
    }
}
