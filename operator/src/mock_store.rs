// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

// In-memory object store and fake node collaborators for reconciler tests.
//
// The store keeps objects as JSON and emulates the API server behaviour the
// controllers depend on: uid/generation/resourceVersion bookkeeping,
// optimistic concurrency, the status subresource, finalizer-gated deletion
// and cascading collection of owned objects.

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::error::ErrorResponse;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::OperatorConfig;
use crate::expectations::Expectations;
use crate::{ContextData, HasStatus};
use crate::probe::{HealthProbe, ProbeError, ProbeTls};
use crate::ssh::{CommandOutput, RemoteShell, ShellSession, SshError, SshTarget};
use crate::store::{Labels, ObjectStore, StoreError, StoreObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Delete,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    mutations: usize,
    failures: HashMap<(String, Verb), usize>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn type_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: StoreObject>(namespace: &str, name: &str) -> Key {
    (type_key::<K>(), namespace.to_string(), name.to_string())
}

fn injected_failure() -> StoreError {
    StoreError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.pointer(&format!("/metadata/{field}"))?.as_str()
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

/// Everything outside metadata and status; a change bumps the generation.
fn content(obj: &Value) -> Value {
    let mut c = obj.clone();
    if let Some(map) = c.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    c
}

fn now_string() -> Value {
    serde_json::to_value(Time(Utc::now().trunc_subsecs(0))).unwrap_or(Value::Null)
}

impl State {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_version(&self, key: &Key, stored: &Value, proposed: Option<&str>) -> Result<(), StoreError> {
        match proposed {
            Some(rv) if Some(rv) != meta_str(stored, "resourceVersion") => Err(StoreError::Conflict {
                kind: key.0.clone(),
                name: key.2.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn take_failure(&mut self, type_key: &str, verb: Verb) -> bool {
        match self.failures.get_mut(&(type_key.to_string(), verb)) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn store_updated(&mut self, key: Key, mut obj: Value) {
        obj["metadata"]["resourceVersion"] = Value::String(self.bump());
        if obj.pointer("/metadata/deletionTimestamp").is_some() && !has_finalizers(&obj) {
            self.remove(&key);
        } else {
            self.objects.insert(key, obj);
        }
    }

    fn remove(&mut self, key: &Key) {
        let Some(obj) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = meta_str(&obj, "uid").map(str::to_string) else {
            return;
        };
        let owned: Vec<Key> = self
            .objects
            .iter()
            .filter(|(k, v)| {
                k.1 == key.1
                    && v.pointer("/metadata/ownerReferences")
                        .and_then(Value::as_array)
                        .is_some_and(|refs| refs.iter().any(|r| r["uid"] == uid.as_str()))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for child in owned {
            self.mark_deleted(&child);
        }
    }

    fn mark_deleted(&mut self, key: &Key) {
        let Some(obj) = self.objects.get(key) else {
            return;
        };
        if !has_finalizers(obj) {
            self.remove(key);
            return;
        }
        if obj.pointer("/metadata/deletionTimestamp").is_none() {
            let mut obj = obj.clone();
            obj["metadata"]["deletionTimestamp"] = now_string();
            obj["metadata"]["resourceVersion"] = Value::String(self.bump());
            self.objects.insert(key.clone(), obj);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes since creation.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Makes the next `count` calls of `verb` on kind `K` fail.
    pub fn fail_next<K: StoreObject>(&self, verb: Verb, count: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((type_key::<K>(), verb), count);
    }

    /// Every object of kind `K` in `namespace`, sorted by name.
    pub fn all<K: StoreObject>(&self, namespace: &str) -> Vec<K> {
        let state = self.state.lock().unwrap();
        let tk = type_key::<K>();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == tk && k.1 == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// Overwrites the stored status, as another controller would.
    pub fn set_status<K: HasStatus>(&self, namespace: &str, name: &str, status: &K::Status) {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        let mut obj = state.objects.get(&key).cloned().unwrap();
        obj["status"] = serde_json::to_value(status).unwrap();
        obj["metadata"]["resourceVersion"] = Value::String(state.bump());
        state.objects.insert(key, obj);
    }

    /// Rewrites raw metadata fields (timestamps and the like) of a stored object.
    pub fn set_metadata<K: StoreObject>(&self, namespace: &str, name: &str, field: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        let obj = state.objects.get_mut(&key).unwrap();
        obj["metadata"][field] = value;
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(&key::<K>(namespace, name))
            .ok_or_else(|| StoreError::not_found::<K>(name))?;
        Ok(serde_json::from_value(obj.clone())?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, StoreError> {
        let state = self.state.lock().unwrap();
        let tk = type_key::<K>();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == tk && k.1 == namespace)
            .filter(|(_, v)| {
                labels
                    .iter()
                    .all(|(lk, lv)| v["metadata"]["labels"][lk].as_str() == Some(lv.as_str()))
            })
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let name = obj.meta().name.clone().ok_or_else(|| StoreError::MissingName {
            kind: K::kind(&()).to_string(),
        })?;
        let key = key::<K>(namespace, &name);
        if state.take_failure(&key.0, Verb::Create) {
            return Err(injected_failure());
        }
        if state.objects.contains_key(&key) {
            return Err(StoreError::already_exists::<K>(&name));
        }
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        let rv = state.bump();
        let meta = &mut value["metadata"];
        meta["namespace"] = Value::String(namespace.to_string());
        meta["uid"] = Value::String(uuid::Uuid::new_v4().to_string());
        meta["generation"] = Value::from(1);
        meta["resourceVersion"] = Value::String(rv);
        meta["creationTimestamp"] = now_string();
        if let Some(m) = meta.as_object_mut() {
            m.remove("deletionTimestamp");
        }
        state.objects.insert(key, value.clone());
        state.mutations += 1;
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let name = obj.meta().name.clone().ok_or_else(|| StoreError::MissingName {
            kind: K::kind(&()).to_string(),
        })?;
        let key = key::<K>(namespace, &name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found::<K>(&name))?;
        state.check_version(&key, &stored, obj.meta().resource_version.as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
        let changed = content(&value) != content(&stored);
        for field in ["namespace", "uid", "creationTimestamp", "deletionTimestamp"] {
            value["metadata"][field] = stored["metadata"][field].clone();
        }
        value["metadata"]["generation"] = Value::from(generation + i64::from(changed));
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        if let Some(m) = value["metadata"].as_object_mut() {
            m.retain(|_, v| !v.is_null());
        }
        state.store_updated(key.clone(), value.clone());
        state.mutations += 1;
        let stored = state.objects.get(&key).cloned().unwrap_or(value);
        Ok(serde_json::from_value(stored)?)
    }

    async fn patch<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found::<K>(name))?;
        state.check_version(
            &key,
            &stored,
            patch.pointer("/metadata/resourceVersion").and_then(Value::as_str),
        )?;

        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let mut value = stored.clone();
        json_patch::merge(&mut value, &patch);
        if content(&value) != content(&stored) {
            let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
            value["metadata"]["generation"] = Value::from(generation + 1);
        }
        state.store_updated(key.clone(), value.clone());
        state.mutations += 1;
        let stored = state.objects.get(&key).cloned().unwrap_or(value);
        Ok(serde_json::from_value(stored)?)
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found::<K>(name))?;
        state.check_version(
            &key,
            &stored,
            patch.pointer("/metadata/resourceVersion").and_then(Value::as_str),
        )?;

        let mut value = stored;
        if let Some(status) = patch.get("status") {
            json_patch::merge(&mut value, &serde_json::json!({ "status": status }));
        }
        value["metadata"]["resourceVersion"] = Value::String(state.bump());
        state.objects.insert(key, value.clone());
        state.mutations += 1;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        if state.take_failure(&key.0, Verb::Delete) {
            return Err(injected_failure());
        }
        if !state.objects.contains_key(&key) {
            return Err(StoreError::not_found::<K>(name));
        }
        state.mark_deleted(&key);
        state.mutations += 1;
        Ok(())
    }
}

/// Shell that records commands and answers with canned results.
#[derive(Clone, Default)]
pub struct FakeShell {
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
    pub unreachable: Arc<Mutex<bool>>,
    pub fail_with: Arc<Mutex<Option<String>>>,
}

struct FakeSession {
    host: String,
    shell: FakeShell,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn dial(&self, target: &SshTarget) -> Result<Box<dyn ShellSession>, SshError> {
        if *self.unreachable.lock().unwrap() {
            return Err(SshError::Dial {
                target: target.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            host: target.host.clone(),
            shell: self.clone(),
        }))
    }
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.shell
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));
        match self.shell.fail_with.lock().unwrap().clone() {
            Some(stderr) => Err(SshError::Command {
                command: command.to_string(),
                status: 1,
                stderr,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeProbe {
    pub healthy: Arc<Mutex<bool>>,
    pub probed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, url: &str, _tls: &ProbeTls) -> Result<bool, ProbeError> {
        self.probed.lock().unwrap().push(url.to_string());
        Ok(*self.healthy.lock().unwrap())
    }
}

pub struct TestContext {
    pub ctx: Arc<ContextData<MemoryStore>>,
    pub store: MemoryStore,
    pub shell: FakeShell,
    pub probe: FakeProbe,
}

pub fn test_context() -> TestContext {
    let store = MemoryStore::new();
    let shell = FakeShell::default();
    let probe = FakeProbe::default();
    let ctx = Arc::new(ContextData {
        store: store.clone(),
        expectations: Arc::new(Expectations::new()),
        shell: Arc::new(shell.clone()),
        prober: Arc::new(probe.clone()),
        config: Arc::new(OperatorConfig::default()),
    });
    TestContext {
        ctx,
        store,
        shell,
        probe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::Resource;

    fn config_map(name: &str, owner_uid: Option<&str>, finalizers: Option<Vec<String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers,
                owner_references: owner_uid.map(|uid| {
                    vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                        uid: uid.to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generation_and_conflicts() {
        let store = MemoryStore::new();
        let created = store.create("ns", &config_map("a", None, None)).await.unwrap();
        assert_eq!(created.meta().generation, Some(1));

        let mut changed = created.clone();
        changed.data = Some(BTreeMap::from([("k".to_string(), "w".to_string())]));
        let replaced = store.replace("ns", &changed).await.unwrap();
        assert_eq!(replaced.meta().generation, Some(2));

        // `created` carries the old resourceVersion now.
        assert!(store.replace("ns", &created).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_cascading_delete() {
        let store = MemoryStore::new();
        let parent = store.create("ns", &config_map("parent", None, None)).await.unwrap();
        let uid = parent.meta().uid.clone().unwrap();
        store.create("ns", &config_map("child", Some(&uid), None)).await.unwrap();
        store
            .create("ns", &config_map("held", Some(&uid), Some(vec!["f".to_string()])))
            .await
            .unwrap();
        store.create("ns", &config_map("other", Some("x"), None)).await.unwrap();

        store.delete::<ConfigMap>("ns", "parent").await.unwrap();
        let names: Vec<_> = store
            .all::<ConfigMap>("ns")
            .into_iter()
            .map(|c| (c.metadata.name.unwrap(), c.metadata.deletion_timestamp.is_some()))
            .collect();
        assert_eq!(
            names,
            vec![("held".to_string(), true), ("other".to_string(), false)]
        );
    }
}
