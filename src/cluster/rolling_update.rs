//! Rolling update flag kept as a pod annotation
//!
//! The flag marks a pod that still needs to be recreated or migrated. It is
//! advisory: a malformed value is logged and read as `false`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::Cluster;
use crate::error::Result;
use crate::k8s::NamespacedName;

/// Parse a boolean the way Go's `strconv.ParseBool` does
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Read the rolling update flag from `pod`; missing or malformed reads as `false`
pub fn rolling_update_flag(pod: &Pod, annotation: &str) -> bool {
    let Some(raw) = pod.annotations().get(annotation) else {
        return false;
    };

    debug!("Found rolling update flag on pod {}", pod.name_any());
    match parse_bool_flag(raw) {
        Some(flag) => flag,
        None => {
            warn!(
                "Error when parsing {:?} annotation for the pod {}: expected boolean value, got {:?}",
                annotation,
                NamespacedName::from_pod(pod),
                raw
            );
            false
        }
    }
}

/// Merge patch touching only the rolling update annotation
pub fn rolling_update_flag_patch(annotation: &str, flag: bool) -> Value {
    json!({
        "metadata": {
            "annotations": {
                annotation: flag.to_string()
            }
        }
    })
}

impl Cluster {
    pub fn get_rolling_update_flag(&self, pod: &Pod) -> bool {
        rolling_update_flag(pod, &self.config().rolling_update_annotation)
    }

    /// Set the rolling update flag on `pod` unless it is already set.
    ///
    /// On success the annotation is also recorded on the passed pod, so a
    /// repeated call is a no-op.
    #[instrument(skip(self, pod), fields(pod = %NamespacedName::from_pod(pod)))]
    pub async fn mark_rolling_update_flag(&self, pod: &mut Pod, reason: &str) -> Result<()> {
        if self.get_rolling_update_flag(pod) {
            return Ok(());
        }

        let name = NamespacedName::from_pod(pod);
        let annotation = self.config().rolling_update_annotation.clone();
        debug!("Mark rolling update annotation for {}: reason {}", name, reason);

        let patch = rolling_update_flag_patch(&annotation, true);
        let api = &self.ctx.api;
        self.config()
            .pod_api_retry()
            .retry("patch pod rolling update flag", || api.patch_pod(&name, &patch))
            .await
            .map_err(|e| e.context(format!("could not patch pod rolling update flag {patch}")))?;

        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotation, true.to_string());
        Ok(())
    }

    /// Flag the pod called `name`, so a later rolling update picks it up.
    ///
    /// A pod that no longer exists needs no flag.
    pub async fn flag_pod_for_rolling_update(&self, name: &NamespacedName, reason: &str) -> Result<()> {
        let mut pod = match self.ctx.api.get_pod(name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!("Pod {} is gone, not flagging it", name);
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("could not get pod {name}"))),
        };
        self.mark_rolling_update_flag(&mut pod, reason).await
    }
}
