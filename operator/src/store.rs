// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Typed access to the declarative object store.
//!
//! Controllers only talk to the API server through [`ObjectStore`], which keeps
//! them independent of the transport and lets tests run against an in-memory
//! store. Every call is fallible and safe to retry.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use log::info;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt::Debug;

pub type Labels = BTreeMap<String, String>;

/// Anything the store can hold: a namespaced, statically typed resource.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("{kind} has no name")]
    MissingName { kind: String },
    #[error(transparent)]
    Kube(kube::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn not_found<K: StoreObject>(name: &str) -> Self {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists<K: StoreObject>(name: &str) -> Self {
        StoreError::AlreadyExists {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict<K: StoreObject>(name: &str) -> Self {
        StoreError::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Clone + Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// Lists objects whose labels contain every pair in `labels`.
    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, StoreError>;

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;

    /// Replaces the object. A set `metadata.resourceVersion` must match.
    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;

    /// JSON merge patch of the main resource. A `metadata.resourceVersion`
    /// carried in the patch must match the stored one.
    async fn patch<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError>;

    /// JSON merge patch of the status subresource.
    async fn patch_status<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError>;

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

// A 409 on create means the name is taken; on any write to an existing
// object it means the resourceVersion did not match.
fn map_kube_error<K: StoreObject>(err: kube::Error, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found::<K>(name),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::conflict::<K>(name),
        e => StoreError::Kube(e),
    }
}

fn map_create_error<K: StoreObject>(err: kube::Error, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::already_exists::<K>(name),
        e => map_kube_error::<K>(e, name),
    }
}

fn required_name<K: StoreObject>(obj: &K) -> Result<String, StoreError> {
    obj.meta().name.clone().ok_or_else(|| StoreError::MissingName {
        kind: K::kind(&()).to_string(),
    })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error::<K>(e, name))
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, StoreError> {
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&label_selector_string(labels));
        }
        let list = self
            .api::<K>(namespace)
            .list(&lp)
            .await
            .map_err(|e| map_kube_error::<K>(e, ""))?;
        Ok(list.items)
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = required_name(obj)?;
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_create_error::<K>(e, &name))
    }

    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = required_name(obj)?;
        self.api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error::<K>(e, &name))
    }

    async fn patch<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError> {
        self.api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error::<K>(e, name))
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError> {
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error::<K>(e, name))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error::<K>(e, name))
    }
}

pub async fn get_opt<S: ObjectStore, K: StoreObject>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, StoreError> {
    match store.get::<K>(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Creates `obj`, or returns the stored object when one with the same name
/// already exists.
pub async fn create_if_absent<S: ObjectStore, K: StoreObject>(
    store: &S,
    namespace: &str,
    obj: &K,
) -> Result<K, StoreError> {
    let name = required_name(obj)?;
    match store.create(namespace, obj).await {
        Ok(created) => {
            info!("Create {} {namespace}/{name}", K::kind(&()));
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            info!("{} {namespace}/{name} already exists", K::kind(&()));
            store.get(namespace, &name).await
        }
        Err(e) => Err(e),
    }
}

/// Objects selected by `selector` whose controller is `owner_uid`. Objects
/// owned by someone else, or by no one, are left out.
pub async fn list_controlled<S: ObjectStore, K: StoreObject>(
    store: &S,
    namespace: &str,
    selector: &LabelSelector,
    owner_uid: &str,
) -> Result<Vec<K>, StoreError> {
    let labels = selector.match_labels.clone().unwrap_or_default();
    let objects = store.list::<K>(namespace, &labels).await?;
    Ok(objects
        .into_iter()
        .filter(|o| selector_matches(selector, o.meta().labels.as_ref().unwrap_or(&Labels::new())))
        .filter(|o| is_controlled_by(o, owner_uid))
        .collect())
}

pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

pub fn controller_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .as_deref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

pub fn is_controlled_by<K: Resource>(child: &K, owner_uid: &str) -> bool {
    controller_uid(child.meta()) == Some(owner_uid)
}

pub fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

pub fn label_selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Evaluates a label selector the way the API server does. An empty selector
/// matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &Labels) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v)),
            "NotIn" => labels.get(&expr.key).is_none_or(|v| !values.contains(v)),
            "Exists" => labels.contains_key(&expr.key),
            "DoesNotExist" => !labels.contains_key(&expr.key),
            _ => false,
        }
    });
    labels_match && expressions_match
}
