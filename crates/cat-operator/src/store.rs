//! Resource store abstraction
//!
//! The reconciler talks to the cluster only through [`ResourceStore`], one
//! instance per resource kind. [`KubeStore`] is the production implementation
//! backed by the Kubernetes API; tests use mocks or an in-memory store.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{DeleteParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// CRUD operations on one namespaced resource kind
///
/// Writes are subject to optimistic concurrency: an object carrying a stale
/// `resourceVersion` is rejected with [`StoreError::Conflict`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object; `Ok(None)` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// Create a new object
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;

    /// Replace an existing object (spec and metadata)
    ///
    /// The reconciler only writes status; this completes the store contract
    /// for callers that edit the object itself.
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError>;

    /// Delete an object
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Replace only the status subresource of an object
    async fn replace_status(&self, namespace: &str, name: &str, obj: &K)
        -> Result<K, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
    #[error("Failed to serialize object: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// Map a kube error onto the store's error classes
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => StoreError::Api(err),
        }
    }
}

/// [`ResourceStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    #[instrument(skip(self), fields(kind = %Self::kind()))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), name))
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind()))]
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let created = self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), &name))?;
        debug!(name = %name, "Created object");
        Ok(created)
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind()))]
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError> {
        self.api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), name))
    }

    #[instrument(skip(self), fields(kind = %Self::kind()))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), name))?;
        debug!(name = %name, "Deleted object");
        Ok(())
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind()))]
    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let data = serde_json::to_vec(obj)?;
        self.api(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|e| StoreError::from_kube(e, &Self::kind(), name))
    }
}
