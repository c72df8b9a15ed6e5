//! Data returned by the Patroni REST API

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Role of a member as reported by `GET /cluster`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberRole {
    Leader,
    StandbyLeader,
    SyncStandby,
    Replica,
    Other(String),
}

impl MemberRole {
    /// Leaders are never switchover candidates
    pub fn is_leader(&self) -> bool {
        matches!(self, MemberRole::Leader | MemberRole::StandbyLeader)
    }
}

impl From<&str> for MemberRole {
    fn from(value: &str) -> Self {
        match value {
            "leader" | "master" | "primary" => MemberRole::Leader,
            "standby_leader" | "standby-leader" => MemberRole::StandbyLeader,
            "sync_standby" | "sync-standby" => MemberRole::SyncStandby,
            "replica" => MemberRole::Replica,
            other => MemberRole::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Leader => write!(f, "leader"),
            MemberRole::StandbyLeader => write!(f, "standby_leader"),
            MemberRole::SyncStandby => write!(f, "sync_standby"),
            MemberRole::Replica => write!(f, "replica"),
            MemberRole::Other(role) => write!(f, "{role}"),
        }
    }
}

impl<'de> Deserialize<'de> for MemberRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MemberRole::from(raw.as_str()))
    }
}

impl Serialize for MemberRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Member state while a replica is still bootstrapping
pub const STATE_CREATING_REPLICA: &str = "creating replica";
/// Member state of a healthy, running member
pub const STATE_RUNNING: &str = "running";

/// Lag reported for members whose position Patroni cannot determine
pub const UNKNOWN_LAG: u64 = u64::MAX;

/// One entry of the `GET /cluster` member list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub role: MemberRole,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeline: Option<u64>,
    /// Replication lag in bytes; `"unknown"` or absent maps to [`UNKNOWN_LAG`]
    #[serde(default = "unknown_lag", deserialize_with = "deserialize_lag")]
    pub lag: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClusterMembers {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

fn unknown_lag() -> u64 {
    UNKNOWN_LAG
}

fn deserialize_lag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lag {
        Bytes(u64),
        Text(String),
    }

    Ok(match Option::<Lag>::deserialize(deserializer)? {
        Some(Lag::Bytes(lag)) => lag,
        Some(Lag::Text(text)) => text.parse().unwrap_or(UNKNOWN_LAG),
        None => UNKNOWN_LAG,
    })
}

/// Response of `GET /patroni` for a single member
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MemberData {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub server_version: Option<u32>,
    #[serde(default)]
    pub pending_restart: bool,
    #[serde(default)]
    pub timeline: Option<u64>,
    #[serde(default)]
    pub patroni: PatroniInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PatroniInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub scope: String,
}

/// Dynamic configuration from `GET /config`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PatroniConfig {
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub loop_wait: Option<u32>,
    #[serde(default)]
    pub retry_timeout: Option<u32>,
    #[serde(default)]
    pub maximum_lag_on_failover: Option<u64>,
    #[serde(default)]
    pub synchronous_mode: bool,
    #[serde(default)]
    pub synchronous_mode_strict: bool,
    #[serde(default)]
    pub failsafe_mode: bool,
    #[serde(default)]
    pub postgresql: PostgresqlSection,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PostgresqlSection {
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl PatroniConfig {
    /// PostgreSQL parameters rendered as strings, the way `postgresql.conf` holds them
    pub fn pg_parameters(&self) -> BTreeMap<String, String> {
        self.postgresql
            .parameters
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}
