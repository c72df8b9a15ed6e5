//! pgcluster-k8s: pod lifecycle and failover for Patroni-managed PostgreSQL
//!
//! Moves PostgreSQL pods off end-of-life Kubernetes nodes, performs
//! controlled switchovers before a primary is disrupted, and recreates
//! flagged pods in a primary-last rolling update.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod k8s;
pub mod patroni;
pub mod retry;

pub use crate::error::{Error, Result};
