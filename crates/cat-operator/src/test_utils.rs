//! Test doubles shared by unit tests
//!
//! [`MemoryStore`] behaves like the API server for the calls the reconciler
//! makes: it assigns resource versions, rejects stale writes and reports
//! missing or duplicate objects.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};

use crate::cat::{Cat, CatSpec, CatStatus};
use crate::controllers::retry::RetryTracker;
use crate::controllers::{Clock, ControllerContext};
use crate::store::{ResourceStore, StoreError};

pub const NAMESPACE: &str = "default";

/// In-memory [`ResourceStore`] with optimistic concurrency
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    version: AtomicU64,
    graceful_delete: AtomicBool,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(1),
            graceful_delete: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    /// Seed an object, bypassing create bookkeeping
    pub fn insert(&self, mut obj: K) {
        obj.meta_mut().resource_version = Some(self.next_version());
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Apply `f` to a stored object in place, as another writer would
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("object to modify must exist");
        f(obj);
        obj.meta_mut().resource_version = Some(version);
    }

    /// Make `delete` only mark objects as terminating, as the API server does
    /// for pods with a grace period. [`finish_termination`](Self::finish_termination)
    /// removes them.
    pub fn set_graceful_delete(&self, on: bool) {
        self.graceful_delete.store(on, Ordering::SeqCst);
    }

    pub fn finish_termination(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Names passed to successful `create` calls, in order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Names passed to successful `delete` calls, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn write(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key) else {
            return Err(StoreError::NotFound {
                kind: Self::kind(),
                name: name.to_string(),
            });
        };
        if obj.meta().resource_version != current.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                name: name.to_string(),
            });
        }

        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.object(namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: Self::kind(),
                name,
            });
        }

        let mut stored = obj.clone();
        stored.meta_mut().namespace = Some(namespace.to_string());
        stored.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, stored.clone());
        self.created.lock().unwrap().push(name);
        Ok(stored)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError> {
        self.write(namespace, name, obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let found = if self.graceful_delete.load(Ordering::SeqCst) {
            let version = self.next_version();
            let mut objects = self.objects.lock().unwrap();
            objects.get_mut(&key).map(|obj| {
                let meta = obj.meta_mut();
                if meta.deletion_timestamp.is_none() {
                    meta.deletion_timestamp = Some(Time(epoch()));
                    meta.resource_version = Some(version);
                }
            })
        } else {
            self.objects.lock().unwrap().remove(&key).map(|_| ())
        };
        match found {
            Some(()) => {
                self.deleted.lock().unwrap().push(name.to_string());
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: Self::kind(),
                name: name.to_string(),
            }),
        }
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        self.write(namespace, name, obj)
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fixed instant used as "now" at the start of scenarios
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// A Cat as the admission gate would have stored it
pub fn test_cat(name: &str, total_lives: i32, duration: &str) -> Cat {
    Cat {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: CatSpec {
            total_lives: Some(total_lives),
            message: Some("meow".to_string()),
            duration: Some(duration.to_string()),
        },
        status: None,
    }
}

pub fn with_status(mut cat: Cat, status: CatStatus) -> Cat {
    cat.status = Some(status);
    cat
}

/// Move a pod to `phase`, as the kubelet would
pub fn set_pod_phase(pods: &MemoryStore<Pod>, name: &str, phase: &str, message: Option<&str>) {
    pods.modify(NAMESPACE, name, |pod| {
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            message: message.map(str::to_string),
            ..Default::default()
        });
    });
}

/// Stores, clock and context wired together
pub struct Harness {
    pub cats: Arc<MemoryStore<Cat>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<ControllerContext>,
}

impl Harness {
    pub fn new() -> Self {
        let cats = Arc::new(MemoryStore::<Cat>::new());
        let pods = Arc::new(MemoryStore::<Pod>::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let ctx = Arc::new(ControllerContext {
            cats: cats.clone(),
            pods: pods.clone(),
            clock: clock.clone(),
            retry_tracker: RetryTracker::new(),
        });
        Self {
            cats,
            pods,
            clock,
            ctx,
        }
    }

    pub fn status(&self, name: &str) -> CatStatus {
        self.cats
            .object(NAMESPACE, name)
            .and_then(|cat| cat.status)
            .unwrap_or_default()
    }
}
