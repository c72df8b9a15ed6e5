//! Error types for pod migration and failover coordination
//!
//! Errors fall into four groups:
//! - transient infrastructure failures (Kubernetes API, Patroni API) that are
//!   retried within a bounded budget before being surfaced,
//! - contract violations (duplicate or missing pod subscriptions) that are
//!   fatal and never retried,
//! - terminal domain conditions (no switchover candidate, pod stuck on the
//!   same node) that the caller may retry on a later pass,
//! - plumbing errors (configuration, serialization).

use thiserror::Error;

use crate::patroni::PatroniError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Patroni REST API error
    #[error("Patroni API error: {0}")]
    Patroni(#[from] PatroniError),

    /// A retried call did not succeed within its time budget
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Programming contract violated, e.g. a duplicate pod subscription
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The target of an operation is not in the expected state
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// No cluster member qualifies as a switchover target
    #[error("no switchover candidate found")]
    NoSwitchoverCandidate,

    /// A recreated pod was scheduled back onto its old node
    #[error("pod {pod} remained on the same node {node}")]
    PodRemainedOnNode { pod: String, node: String },

    /// More than one pod carries the primary role label
    #[error("too many primaries: {0}")]
    TooManyPrimaries(usize),

    /// The Patroni member is still bootstrapping
    #[error("replica currently being initialized")]
    MemberInitializing,

    /// A wait on the pod event bus hit its deadline
    #[error("timeout waiting for {0}")]
    WaitTimeout(String),

    /// A wait on the pod event bus was abandoned by its caller
    #[error("wait for {0} cancelled")]
    WaitCancelled(String),

    /// The subscription channel closed while a pod was still expected
    #[error("subscription for pod {0} closed")]
    SubscriptionClosed(String),

    /// A multi-step operation failed; carries the operation and pod identity
    #[error("{context}: {source}")]
    Operation {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// The worker owning a cluster is no longer accepting tasks
    #[error("migration worker {0} has stopped")]
    WorkerStopped(usize),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error with the operation and pod it belongs to
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Operation {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Contract violations signal a caller bug and must abort the operation
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ContractViolation(_) => true,
            Error::RetryExhausted { source, .. } | Error::Operation { source, .. } => {
                source.is_fatal()
            }
            _ => false,
        }
    }

    /// Transient infrastructure failures worth another attempt later
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::Patroni(_) | Error::RetryExhausted { .. } => true,
            Error::Operation { source, .. } => source.is_retriable(),
            _ => false,
        }
    }

    /// Returns true if the error is a Kubernetes `404 Not Found`
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::Operation { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
