//! Lease-based leader election
//!
//! Only the replica holding the lease queues migrations. Every replica keeps
//! watching pods so the event bus stays warm for a takeover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "pgcluster-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// True when nobody renewed the lease within its duration
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    spec.and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true)
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag flipped by [`LeaderElector::run`]
    pub fn is_leader(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    pub async fn run(self) {
        info!("Leader election using holder ID: {}", self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if !self.is_leader.swap(true, Ordering::Relaxed) {
                        info!("Acquired leadership for lease {}", LEASE_NAME);
                    }
                    tokio::time::sleep(RENEW_INTERVAL).await;
                }
                Ok(false) => {
                    if self.is_leader.swap(false, Ordering::Relaxed) {
                        warn!("Lost leadership for lease {}", LEASE_NAME);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!("Leader election error: {}", e);
                    self.is_leader.store(false, Ordering::Relaxed);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();

        match self.leases.get(LEASE_NAME).await {
            Ok(existing) => {
                let spec = existing.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_deref());

                let patch = if holder == Some(self.identity.as_str()) {
                    serde_json::json!({
                        "spec": {
                            "renewTime": MicroTime(now),
                            "leaseDurationSeconds": LEASE_DURATION_SECS,
                        }
                    })
                } else if lease_expired(spec, now) {
                    info!("Lease held by {:?} has expired, taking over", holder);
                    serde_json::json!({
                        "spec": {
                            "holderIdentity": self.identity,
                            "acquireTime": MicroTime(now),
                            "renewTime": MicroTime(now),
                            "leaseDurationSeconds": LEASE_DURATION_SECS,
                        }
                    })
                } else {
                    return Ok(false);
                };

                self.leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(true)
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                self.leases.create(&PostParams::default(), &lease).await?;
                info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}
