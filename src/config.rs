//! Operator configuration
//!
//! Defaults are built in, can be overridden by an optional YAML file, and
//! finally by command-line flags or environment variables (see `main.rs`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Configuration shared by every cluster handled by the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct OperatorConfig {
    /// Pod label holding the Patroni role (`primary`/`master` or `replica`)
    pub pod_role_label: String,

    /// Pod label holding the cluster name; also the StatefulSet name
    pub cluster_name_label: String,

    /// Labels every cluster pod carries besides the cluster name
    pub cluster_labels: BTreeMap<String, String>,

    /// Label/value pairs a node must carry to be considered ready.
    /// An empty map marks every schedulable node as ready.
    pub node_readiness_label: BTreeMap<String, String>,

    /// Pod annotation holding the rolling update flag
    pub rolling_update_annotation: String,

    /// Retry budget for simple pod operations (patch, delete)
    #[serde(with = "humane_duration")]
    pub pod_api_retry_interval: Duration,
    #[serde(with = "humane_duration")]
    pub pod_api_retry_timeout: Duration,

    /// Retry budget for Patroni API queries
    #[serde(with = "humane_duration")]
    pub patroni_api_check_interval: Duration,
    #[serde(with = "humane_duration")]
    pub patroni_api_check_timeout: Duration,

    /// Retry budget for the switchover call during primary migration
    #[serde(with = "humane_duration")]
    pub failover_retry_interval: Duration,
    #[serde(with = "humane_duration")]
    pub failover_retry_timeout: Duration,

    /// Upper bound for observing a pod deletion
    #[serde(with = "humane_duration")]
    pub pod_deletion_wait_timeout: Duration,

    /// Upper bound for observing a recreated pod with its role label
    #[serde(with = "humane_duration")]
    pub pod_label_wait_timeout: Duration,

    /// Port of the Patroni REST API inside each pod
    pub patroni_api_port: u16,

    /// Number of migration workers
    pub workers: usize,

    /// Interval of the sweep that picks up pods still flagged for rolling update
    #[serde(with = "humane_duration")]
    pub resync_period: Duration,

    /// Restrict watches to one namespace; all namespaces when unset
    pub watched_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_role_label: "spilo-role".to_string(),
            cluster_name_label: "cluster-name".to_string(),
            cluster_labels: BTreeMap::from([("application".to_string(), "spilo".to_string())]),
            node_readiness_label: BTreeMap::new(),
            rolling_update_annotation: "zalando-postgres-operator-rolling-update-required"
                .to_string(),
            pod_api_retry_interval: Duration::from_secs(1),
            pod_api_retry_timeout: Duration::from_secs(5),
            patroni_api_check_interval: Duration::from_secs(1),
            patroni_api_check_timeout: Duration::from_secs(5),
            failover_retry_interval: Duration::from_secs(60),
            failover_retry_timeout: Duration::from_secs(300),
            pod_deletion_wait_timeout: Duration::from_secs(600),
            pod_label_wait_timeout: Duration::from_secs(600),
            patroni_api_port: 8008,
            workers: 8,
            resync_period: Duration::from_secs(1800),
            watched_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file; missing keys keep their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::ConfigError(format!("invalid config: {e}")))
    }

    /// Reject settings the retry combinator or the worker pool cannot honour
    pub fn validate(&self) -> Result<()> {
        self.pod_api_retry().validate("pod API retry")?;
        self.patroni_api_retry().validate("Patroni API retry")?;
        self.failover_retry().validate("failover retry")?;
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.pod_role_label.is_empty() || self.cluster_name_label.is_empty() {
            return Err(Error::ConfigError(
                "pod_role_label and cluster_name_label must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pod_api_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.pod_api_retry_interval, self.pod_api_retry_timeout)
    }

    pub fn patroni_api_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.patroni_api_check_interval,
            self.patroni_api_check_timeout,
        )
    }

    pub fn failover_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.failover_retry_interval, self.failover_retry_timeout)
    }

    /// Label selector matching every pod of any managed cluster
    pub fn all_clusters_selector(&self) -> String {
        let mut parts: Vec<String> = self
            .cluster_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.push(self.cluster_name_label.clone());
        parts.join(",")
    }
}

/// Parse a duration such as `"5s"` or `"10m"`; used by clap value parsers
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

mod humane_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pod_role_label, "spilo-role");
        assert_eq!(config.failover_retry_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_yaml_overrides_keep_other_defaults() {
        let yaml = r#"
pod_role_label: role
patroni_api_check_timeout: 2m
node_readiness_label:
  lifecycle-status: ready
"#;
        let config = OperatorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pod_role_label, "role");
        assert_eq!(config.patroni_api_check_timeout, Duration::from_secs(120));
        assert_eq!(
            config.node_readiness_label.get("lifecycle-status"),
            Some(&"ready".to_string())
        );
        assert_eq!(config.cluster_name_label, "cluster-name");
        assert_eq!(config.patroni_api_port, 8008);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: 3\nwatched_namespace: databases").unwrap();

        let config = OperatorConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.watched_namespace.as_deref(), Some("databases"));
    }

    #[test]
    fn test_invalid_duration_is_config_error() {
        let err = OperatorConfig::from_yaml_str("pod_api_retry_timeout: soon").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_validate_rejects_timeout_below_interval() {
        let config = OperatorConfig {
            failover_retry_interval: Duration::from_secs(60),
            failover_retry_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = OperatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_clusters_selector() {
        let config = OperatorConfig::default();
        assert_eq!(config.all_clusters_selector(), "application=spilo,cluster-name");
    }
}
