//! Kubernetes controllers for watched resources

pub mod cat;
pub mod retry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;

use crate::cat::Cat;
use crate::store::{KubeStore, ResourceStore};
use retry::RetryTracker;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared state for the Cat controller
pub struct ControllerContext {
    /// Cat objects and their status subresource
    pub cats: Arc<dyn ResourceStore<Cat>>,
    /// Pods created for each life
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub clock: Arc<dyn Clock>,
    /// Failure counts for backoff
    pub retry_tracker: RetryTracker,
}

impl ControllerContext {
    /// Context backed by the API server
    pub fn new(client: Client) -> Self {
        Self {
            cats: Arc::new(KubeStore::<Cat>::new(client.clone())),
            pods: Arc::new(KubeStore::<Pod>::new(client)),
            clock: Arc::new(SystemClock),
            retry_tracker: RetryTracker::new(),
        }
    }
}
