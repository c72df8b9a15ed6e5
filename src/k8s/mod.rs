//! Kubernetes-facing types and the control-plane abstraction
//!
//! The migration core never talks to `kube::Api` directly; it goes through
//! [`ControlPlane`] so that the same logic runs against the real API server
//! and the in-memory fake used in tests.

mod control_plane;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

pub use control_plane::{ControlPlane, KubeControlPlane};

/// Namespace-qualified object name, printed as `namespace/name`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            name: pod.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for NamespacedName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            None if !s.is_empty() => Ok(Self::new("default", s)),
            _ => Err(format!("invalid object name {s:?}, expected namespace/name")),
        }
    }
}

/// Role of a PostgreSQL pod as published in its role label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodRole {
    Primary,
    Replica,
}

impl PodRole {
    /// Parse a role label value. Spilo's legacy `master` counts as primary.
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "primary" | "master" => Some(PodRole::Primary),
            "replica" => Some(PodRole::Replica),
            _ => None,
        }
    }

    /// Label values matching this role in selectors
    pub fn label_values(&self) -> &'static [&'static str] {
        match self {
            PodRole::Primary => &["master", "primary"],
            PodRole::Replica => &["replica"],
        }
    }
}

impl fmt::Display for PodRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodRole::Primary => write!(f, "primary"),
            PodRole::Replica => write!(f, "replica"),
        }
    }
}

/// Role read from `role_label`, `None` when unset or unknown
pub fn pod_role(pod: &Pod, role_label: &str) -> Option<PodRole> {
    pod.labels()
        .get(role_label)
        .and_then(|v| PodRole::from_label(v))
}

/// Name of the node the pod is scheduled on
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// Returns true if every key/value of `wanted` is present in `labels`
pub fn labels_contain(labels: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Render a label map as an equality-based selector, `k1=v1,k2=v2`
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
