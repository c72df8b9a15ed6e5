//! In-memory control plane and Patroni fakes for cluster tests
//!
//! Deleting a pod through [`FakeControlPlane`] behaves like a StatefulSet
//! controller: the pod is replaced by a new instance and both the deletion
//! and the new pod are published to the event bus.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;
use serde_json::{json, Value};

use super::{Cluster, ClusterContext, PodEvent, PodEventBus, PodEventType};
use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::k8s::{pod_node_name, pod_role, ControlPlane, NamespacedName, PodRole};
use crate::patroni::{
    ClusterMember, Coordinator, FailoverExecutor, MemberData, MemberRole, PatroniConfig,
};

pub const NAMESPACE: &str = "default";
pub const CLUSTER_NAME: &str = "acid-test";
pub const ROLE_LABEL: &str = "spilo-role";

/// Shared, ordered record of mutating calls across fakes
pub type OpLog = Arc<Mutex<Vec<String>>>;

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(kind: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

pub fn make_pod(name: &str, node: &str, role: Option<PodRole>) -> Pod {
    let mut labels = BTreeMap::from([
        ("application".to_string(), "spilo".to_string()),
        ("cluster-name".to_string(), CLUSTER_NAME.to_string()),
    ]);
    if let Some(role) = role {
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            uid: Some(format!("{name}-uid-0")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some("10.0.0.10".to_string()),
            ..Default::default()
        }),
    }
}

pub fn make_node(name: &str, unschedulable: bool, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn member(name: &str, role: &str, state: &str, lag: u64) -> ClusterMember {
    ClusterMember {
        name: name.to_string(),
        role: MemberRole::from(role),
        state: state.to_string(),
        api_url: None,
        host: None,
        port: None,
        timeline: Some(1),
        lag,
    }
}

/// Evaluate the selector subset the cluster uses: `k=v`, `k in (a,b)` and `k`
fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    let mut terms = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in selector.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                terms.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    terms.push(current);

    terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).all(|term| {
        if let Some((key, values)) = term.split_once(" in ") {
            let values = values.trim_matches(|c| c == '(' || c == ')' || c == ' ');
            labels
                .get(key.trim())
                .is_some_and(|v| values.split(',').any(|w| w.trim() == v))
        } else if let Some((key, value)) = term.split_once('=') {
            labels.get(key) == Some(&value.to_string())
        } else {
            labels.contains_key(term)
        }
    })
}

#[derive(Default)]
struct ControlPlaneState {
    pods: BTreeMap<NamespacedName, Pod>,
    nodes: BTreeMap<String, Node>,
    stateful_set: Option<StatefulSet>,
    stateful_set_fetches: usize,
    deleted: Vec<NamespacedName>,
    patches: usize,
    failing_patches: u32,
    failing_deletes: HashSet<String>,
    placements: HashMap<String, (String, Option<PodRole>)>,
    recreations: u64,
}

/// Fake Kubernetes API; deleting a pod recreates it on another node
pub struct FakeControlPlane {
    state: Mutex<ControlPlaneState>,
    events: Arc<PodEventBus>,
    log: OpLog,
    default_node: String,
}

impl FakeControlPlane {
    pub fn new(events: Arc<PodEventBus>, log: OpLog) -> Self {
        Self {
            state: Mutex::new(ControlPlaneState::default()),
            events,
            log,
            default_node: "live-node".to_string(),
        }
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().nodes.insert(name, node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state
            .lock()
            .unwrap()
            .pods
            .insert(NamespacedName::from_pod(&pod), pod);
    }

    pub fn pod(&self, name: &NamespacedName) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub fn set_replicas(&self, replicas: i32) {
        self.state.lock().unwrap().stateful_set = Some(StatefulSet {
            metadata: ObjectMeta {
                name: Some(CLUSTER_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: None,
        });
    }

    /// Where and with which role the replacement of `pod` comes back
    pub fn place(&self, pod: &str, node: &str, role: Option<PodRole>) {
        self.state
            .lock()
            .unwrap()
            .placements
            .insert(pod.to_string(), (node.to_string(), role));
    }

    pub fn fail_next_patches(&self, count: u32) {
        self.state.lock().unwrap().failing_patches = count;
    }

    pub fn fail_delete_of(&self, pod: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(pod.to_string());
    }

    /// Patch attempts, failed ones included
    pub fn patch_count(&self) -> usize {
        self.state.lock().unwrap().patches
    }

    pub fn deleted(&self) -> Vec<NamespacedName> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn stateful_set_fetches(&self) -> usize {
        self.state.lock().unwrap().stateful_set_fetches
    }

    fn replace(&self, name: &NamespacedName) -> Result<(Pod, Pod)> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(&name.name) {
            return Err(api_error(
                500,
                "InternalError",
                format!("etcdserver: request timed out deleting {name}"),
            ));
        }

        let old = state
            .pods
            .remove(name)
            .ok_or_else(|| not_found("pods", &name.name))?;
        state.deleted.push(name.clone());
        state.recreations += 1;

        let (node, role) = state
            .placements
            .get(&name.name)
            .cloned()
            .unwrap_or_else(|| (self.default_node.clone(), pod_role(&old, ROLE_LABEL)));

        let mut new = make_pod(&name.name, &node, role);
        new.metadata.uid = Some(format!("{}-uid-{}", name.name, state.recreations));
        state.pods.insert(name.clone(), new.clone());
        Ok((old, new))
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_pod(&self, name: &NamespacedName) -> Result<Pod> {
        self.pod(name).ok_or_else(|| not_found("pods", &name.name))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|(name, pod)| {
                name.namespace == namespace
                    && selector_matches(
                        pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
                        label_selector,
                    )
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_all_pods(&self, label_selector: &str, node_name: Option<&str>) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|pod| {
                selector_matches(
                    pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
                    label_selector,
                ) && node_name.map_or(true, |node| pod_node_name(pod) == Some(node))
            })
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &NamespacedName) -> Result<()> {
        let (old, new) = self.replace(name)?;
        self.log.lock().unwrap().push(format!("delete {}", name.name));

        self.events
            .publish(PodEvent::new(PodEventType::Delete, None, old))
            .await;
        self.events
            .publish(PodEvent::new(PodEventType::Add, None, new))
            .await;
        Ok(())
    }

    async fn patch_pod(&self, name: &NamespacedName, patch: &Value) -> Result<Pod> {
        let mut state = self.state.lock().unwrap();
        state.patches += 1;
        if state.failing_patches > 0 {
            state.failing_patches -= 1;
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }

        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| not_found("pods", &name.name))?;
        if let Some(annotations) = patch["metadata"]["annotations"].as_object() {
            let target = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (k, v) in annotations {
                target.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
        Ok(pod.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("nodes", name))
    }

    async fn get_stateful_set(&self, name: &NamespacedName) -> Result<StatefulSet> {
        let mut state = self.state.lock().unwrap();
        state.stateful_set_fetches += 1;
        state
            .stateful_set
            .clone()
            .ok_or_else(|| not_found("statefulsets", &name.name))
    }
}

#[derive(Default)]
struct PatroniState {
    members: Vec<ClusterMember>,
    member_state: String,
    member_queries: u32,
    failing_member_queries: u32,
    failing_switchovers: u32,
    switchover_attempts: u32,
    switchovers: Vec<(NamespacedName, NamespacedName)>,
}

/// Fake Patroni coordinator and failover executor
pub struct FakePatroni {
    state: Mutex<PatroniState>,
    log: OpLog,
}

impl FakePatroni {
    pub fn new(log: OpLog) -> Self {
        Self {
            state: Mutex::new(PatroniState {
                member_state: "running".to_string(),
                ..Default::default()
            }),
            log,
        }
    }

    pub fn set_members(&self, members: Vec<ClusterMember>) {
        self.state.lock().unwrap().members = members;
    }

    pub fn set_member_state(&self, state: &str) {
        self.state.lock().unwrap().member_state = state.to_string();
    }

    pub fn fail_next_member_queries(&self, count: u32) {
        self.state.lock().unwrap().failing_member_queries = count;
    }

    pub fn fail_next_switchovers(&self, count: u32) {
        self.state.lock().unwrap().failing_switchovers = count;
    }

    pub fn member_queries(&self) -> u32 {
        self.state.lock().unwrap().member_queries
    }

    pub fn switchover_attempts(&self) -> u32 {
        self.state.lock().unwrap().switchover_attempts
    }

    pub fn switchovers(&self) -> Vec<(NamespacedName, NamespacedName)> {
        self.state.lock().unwrap().switchovers.clone()
    }
}

#[async_trait]
impl Coordinator for FakePatroni {
    async fn get_config(&self, _pod: &Pod) -> Result<(PatroniConfig, BTreeMap<String, String>)> {
        let config: PatroniConfig = serde_json::from_value(json!({
            "ttl": 30,
            "loop_wait": 10,
            "synchronous_mode": true,
            "postgresql": {"parameters": {"max_connections": 100}}
        }))?;
        let parameters = config.pg_parameters();
        Ok((config, parameters))
    }

    async fn get_member_data(&self, _pod: &Pod) -> Result<MemberData> {
        Ok(MemberData {
            state: self.state.lock().unwrap().member_state.clone(),
            role: "replica".to_string(),
            ..Default::default()
        })
    }

    async fn get_cluster_members(&self, _pod: &Pod) -> Result<Vec<ClusterMember>> {
        let mut state = self.state.lock().unwrap();
        state.member_queries += 1;
        if state.failing_member_queries > 0 {
            state.failing_member_queries -= 1;
            return Err(Error::Patroni(crate::patroni::PatroniError::UnexpectedStatus {
                url: "http://10.0.0.10:8008/cluster".to_string(),
                status: 503,
                body: "no leader".to_string(),
            }));
        }
        Ok(state.members.clone())
    }
}

#[async_trait]
impl FailoverExecutor for FakePatroni {
    async fn switchover(&self, primary: &Pod, candidate: &NamespacedName) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.switchover_attempts += 1;
        if state.failing_switchovers > 0 {
            state.failing_switchovers -= 1;
            return Err(Error::Patroni(crate::patroni::PatroniError::UnexpectedStatus {
                url: "http://10.0.0.10:8008/switchover".to_string(),
                status: 412,
                body: "candidate is not healthy".to_string(),
            }));
        }

        let leader = NamespacedName::from_pod(primary);
        self.log
            .lock()
            .unwrap()
            .push(format!("switchover {}->{}", leader.name, candidate.name));
        state.switchovers.push((leader, candidate.clone()));
        Ok(())
    }
}

/// A cluster wired to fresh fakes
///
/// Nodes: `live-node` and `live-node-2` are ready, `old-node` and
/// `old-node-2` are cordoned. The StatefulSet wants three replicas.
pub struct Harness {
    pub config: Arc<OperatorConfig>,
    pub api: Arc<FakeControlPlane>,
    pub patroni: Arc<FakePatroni>,
    pub events: Arc<PodEventBus>,
    pub log: OpLog,
}

impl Harness {
    pub fn new() -> Self {
        let config = OperatorConfig {
            node_readiness_label: BTreeMap::from([(
                "lifecycle-status".to_string(),
                "ready".to_string(),
            )]),
            pod_deletion_wait_timeout: Duration::from_secs(5),
            pod_label_wait_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let log: OpLog = Arc::default();
        let events = Arc::new(PodEventBus::new());
        let api = Arc::new(FakeControlPlane::new(events.clone(), log.clone()));
        let patroni = Arc::new(FakePatroni::new(log.clone()));

        let ready = [("lifecycle-status", "ready")];
        api.add_node(make_node("live-node", false, &ready));
        api.add_node(make_node("live-node-2", false, &ready));
        api.add_node(make_node("old-node", true, &ready));
        api.add_node(make_node("old-node-2", true, &ready));
        api.set_replicas(3);

        Self {
            config: Arc::new(config),
            api,
            patroni,
            events,
            log,
        }
    }

    pub fn context(&self) -> ClusterContext {
        ClusterContext {
            config: self.config.clone(),
            api: self.api.clone(),
            patroni: self.patroni.clone(),
            failover: self.patroni.clone(),
            events: self.events.clone(),
        }
    }

    pub fn cluster(&self) -> Cluster {
        Cluster::new(NamespacedName::new(NAMESPACE, CLUSTER_NAME), self.context())
    }

    pub fn add_pod(&self, name: &str, node: &str, role: PodRole) -> Pod {
        let pod = make_pod(name, node, Some(role));
        self.api.add_pod(pod.clone());
        pod
    }

    pub fn operations(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}
