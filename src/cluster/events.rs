//! Per-pod publish/subscribe bridge between the pod watcher and blocking waits
//!
//! The pod watcher publishes every observed change; an operation that needs
//! to observe the effect of its own action (deletion, recreation) subscribes
//! to the pod *before* acting and waits on its [`PodSubscription`].
//!
//! At most one subscription per pod may exist. A duplicate subscribe or an
//! unsubscribe without a subscription is a contract violation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::k8s::{pod_role, NamespacedName, PodRole};

/// Buffered events per subscription before the publisher waits
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodEventType {
    Add,
    Update,
    Delete,
}

/// A change to a single pod as seen by the watcher
#[derive(Clone, Debug)]
pub struct PodEvent {
    pub pod_name: NamespacedName,
    pub event_type: PodEventType,
    /// Last version seen before this event, if any
    pub prev_pod: Option<Pod>,
    /// Current version; for deletions the final state of the pod
    pub cur_pod: Pod,
}

impl PodEvent {
    pub fn new(event_type: PodEventType, prev_pod: Option<Pod>, cur_pod: Pod) -> Self {
        Self {
            pod_name: NamespacedName::from_pod(&cur_pod),
            event_type,
            prev_pod,
            cur_pod,
        }
    }
}

/// Receiving side of a pod subscription
#[derive(Debug)]
pub struct PodSubscription {
    pod_name: NamespacedName,
    events: mpsc::Receiver<PodEvent>,
}

impl PodSubscription {
    pub fn pod_name(&self) -> &NamespacedName {
        &self.pod_name
    }

    /// Next event for the pod, `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<PodEvent> {
        self.events.recv().await
    }
}

/// Registry of pod subscriptions, fed by the pod watcher
#[derive(Debug, Default)]
pub struct PodEventBus {
    subscribers: Mutex<HashMap<NamespacedName, mpsc::Sender<PodEvent>>>,
}

impl PodEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NamespacedName, mpsc::Sender<PodEvent>>> {
        // The map stays consistent even if a holder panicked
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the single waiter for `pod_name`
    pub fn subscribe(&self, pod_name: &NamespacedName) -> Result<PodSubscription> {
        debug!("Subscribing to pod {}", pod_name);
        let mut subscribers = self.lock();
        if subscribers.contains_key(pod_name) {
            return Err(Error::ContractViolation(format!(
                "pod {pod_name} is already subscribed"
            )));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        subscribers.insert(pod_name.clone(), tx);
        Ok(PodSubscription {
            pod_name: pod_name.clone(),
            events: rx,
        })
    }

    /// Remove the subscription, closing its channel and releasing any waiter
    pub fn unsubscribe(&self, pod_name: &NamespacedName) -> Result<()> {
        debug!("Unsubscribing from pod {} events", pod_name);
        match self.lock().remove(pod_name) {
            Some(_sender) => Ok(()),
            None => Err(Error::ContractViolation(format!(
                "subscriber for pod {pod_name} is not found"
            ))),
        }
    }

    pub fn is_subscribed(&self, pod_name: &NamespacedName) -> bool {
        self.lock().contains_key(pod_name)
    }

    /// Deliver an event to the pod's subscriber, if there is one.
    ///
    /// The registry lock is released before sending. Returns whether the
    /// event was handed to a subscriber.
    pub async fn publish(&self, event: PodEvent) -> bool {
        let sender = self.lock().get(&event.pod_name).cloned();
        let Some(sender) = sender else {
            return false;
        };

        trace!("Delivering {:?} event for pod {}", event.event_type, event.pod_name);
        sender.send(event).await.is_ok()
    }
}

/// Block until the subscribed pod is observed as deleted.
///
/// A closed subscription means nobody will report further changes; the
/// cluster state is taken as consistent and the wait succeeds.
pub async fn wait_for_pod_deletion(sub: &mut PodSubscription, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Some(event) if event.event_type == PodEventType::Delete => return Ok(()),
                Some(_) => continue,
                None => return Ok(()),
            },
            _ = &mut deadline => {
                return Err(Error::WaitTimeout(format!("deletion of pod {}", sub.pod_name)));
            }
        }
    }
}

/// Block until a live pod with a role label shows up for the subscription.
///
/// With `expected` set only that role matches; otherwise any primary or
/// replica does. Returns the observed pod. `cancel` fires when its sender
/// sends or is dropped.
pub async fn wait_for_pod_label(
    sub: &mut PodSubscription,
    cancel: &mut oneshot::Receiver<()>,
    role_label: &str,
    expected: Option<PodRole>,
    timeout: Duration,
) -> Result<Pod> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else {
                    return Err(Error::SubscriptionClosed(sub.pod_name.to_string()));
                };
                if event.event_type == PodEventType::Delete
                    || event.cur_pod.metadata.deletion_timestamp.is_some()
                {
                    continue;
                }
                let matched = match (pod_role(&event.cur_pod, role_label), expected) {
                    (Some(role), Some(wanted)) => role == wanted,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matched {
                    return Ok(event.cur_pod);
                }
            }
            _ = &mut deadline => {
                return Err(Error::WaitTimeout(format!("role label on pod {}", sub.pod_name)));
            }
            _ = &mut *cancel => {
                return Err(Error::WaitCancelled(format!("role label on pod {}", sub.pod_name)));
            }
        }
    }
}
