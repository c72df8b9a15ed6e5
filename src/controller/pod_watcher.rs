//! Feeds the pod event bus from a Kubernetes pod watch

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::cluster::{PodEvent, PodEventBus, PodEventType};
use crate::config::OperatorConfig;
use crate::k8s::NamespacedName;

/// Turns watcher events into add/update/delete pod events.
///
/// Keeps the last seen version of every pod so updates carry the previous
/// state, and so pods that vanished while the watch was down are reported
/// as deleted after a relist.
#[derive(Default)]
pub struct PodEventTranslator {
    known: HashMap<NamespacedName, Pod>,
    relisted: Option<HashSet<NamespacedName>>,
}

impl PodEventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: watcher::Event<Pod>) -> Vec<PodEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(NamespacedName::from_pod(&pod));
                }
                self.apply(pod)
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<NamespacedName> = self
                    .known
                    .keys()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|name| self.known.remove(&name))
                    .map(|pod| PodEvent::new(PodEventType::Delete, None, pod))
                    .collect()
            }
            watcher::Event::Apply(pod) => self.apply(pod),
            watcher::Event::Delete(pod) => {
                let prev = self.known.remove(&NamespacedName::from_pod(&pod));
                vec![PodEvent::new(PodEventType::Delete, prev, pod)]
            }
        }
    }

    /// A pod whose uid changed was replaced while the watch was not looking;
    /// report the old instance as deleted before the new one
    fn apply(&mut self, pod: Pod) -> Vec<PodEvent> {
        match self.known.insert(NamespacedName::from_pod(&pod), pod.clone()) {
            Some(prev) if prev.metadata.uid != pod.metadata.uid => vec![
                PodEvent::new(PodEventType::Delete, None, prev),
                PodEvent::new(PodEventType::Add, None, pod),
            ],
            Some(prev) => vec![PodEvent::new(PodEventType::Update, Some(prev), pod)],
            None => vec![PodEvent::new(PodEventType::Add, None, pod)],
        }
    }
}

/// Watch every cluster pod and publish its changes until the watch ends
pub async fn run_pod_watcher(client: Client, config: Arc<OperatorConfig>, events: Arc<PodEventBus>) {
    let pods: Api<Pod> = match &config.watched_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let selector = config.all_clusters_selector();
    info!("Watching pods matching {}", selector);

    let mut translator = PodEventTranslator::new();
    let mut stream = watcher(pods, watcher::Config::default().labels(&selector))
        .default_backoff()
        .boxed();

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                for pod_event in translator.translate(event) {
                    let name = pod_event.pod_name.clone();
                    if events.publish(pod_event).await {
                        debug!("Delivered event for pod {}", name);
                    }
                }
            }
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }
    warn!("Pod watch stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::make_pod;
    use crate::k8s::PodRole;

    #[test]
    fn test_apply_and_delete() {
        let mut translator = PodEventTranslator::new();
        let pod = make_pod("acid-test-0", "node-a", None);
        let labeled = make_pod("acid-test-0", "node-a", Some(PodRole::Replica));

        let added = translator.translate(watcher::Event::Apply(pod.clone()));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].event_type, PodEventType::Add);

        let updated = translator.translate(watcher::Event::Apply(labeled.clone()));
        assert_eq!(updated[0].event_type, PodEventType::Update);
        assert_eq!(updated[0].prev_pod.as_ref(), Some(&pod));
        assert_eq!(updated[0].cur_pod, labeled);

        let deleted = translator.translate(watcher::Event::Delete(labeled.clone()));
        assert_eq!(deleted[0].event_type, PodEventType::Delete);
        assert_eq!(deleted[0].prev_pod.as_ref(), Some(&labeled));
    }

    #[test]
    fn test_relist_reports_vanished_pods() {
        let mut translator = PodEventTranslator::new();
        translator.translate(watcher::Event::Apply(make_pod("acid-test-0", "node-a", None)));
        translator.translate(watcher::Event::Apply(make_pod("acid-test-1", "node-a", None)));

        assert!(translator.translate(watcher::Event::Init).is_empty());
        let relisted =
            translator.translate(watcher::Event::InitApply(make_pod("acid-test-1", "node-b", None)));
        assert_eq!(relisted[0].event_type, PodEventType::Update);

        let done = translator.translate(watcher::Event::InitDone);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].event_type, PodEventType::Delete);
        assert_eq!(done[0].pod_name, NamespacedName::new("default", "acid-test-0"));

        // A stray InitDone does not report anything
        assert!(translator.translate(watcher::Event::InitDone).is_empty());
    }

    #[test]
    fn test_relist_reports_replaced_pod() {
        let mut translator = PodEventTranslator::new();
        let old = make_pod("acid-test-0", "old-node", Some(PodRole::Primary));
        translator.translate(watcher::Event::Apply(old.clone()));

        let mut replacement = make_pod("acid-test-0", "node-b", None);
        replacement.metadata.uid = Some("acid-test-0-uid-1".to_string());

        translator.translate(watcher::Event::Init);
        let relisted = translator.translate(watcher::Event::InitApply(replacement.clone()));
        assert_eq!(relisted.len(), 2);
        assert_eq!(relisted[0].event_type, PodEventType::Delete);
        assert_eq!(relisted[0].cur_pod, old);
        assert_eq!(relisted[1].event_type, PodEventType::Add);
        assert_eq!(relisted[1].cur_pod, replacement);
        assert!(translator.translate(watcher::Event::InitDone).is_empty());
    }

    #[tokio::test]
    async fn test_replaced_pod_releases_deletion_waiter() {
        let bus = PodEventBus::new();
        let name = NamespacedName::new("default", "acid-test-0");
        let mut sub = bus.subscribe(&name).unwrap();
        let mut translator = PodEventTranslator::new();
        translator.translate(watcher::Event::Apply(make_pod("acid-test-0", "old-node", None)));

        let mut replacement = make_pod("acid-test-0", "node-b", None);
        replacement.metadata.uid = Some("acid-test-0-uid-1".to_string());
        translator.translate(watcher::Event::Init);
        for event in translator.translate(watcher::Event::InitApply(replacement)) {
            bus.publish(event).await;
        }

        crate::cluster::wait_for_pod_deletion(&mut sub, std::time::Duration::from_secs(5))
            .await
            .unwrap();
    }
}
