// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

// This file has two intended purposes:
// - Speed up development by allowing for building dependencies in a lower container image layer.
// - Provide definitions and functionalities to be used across modules in this crate.
//
// Use in other crates is not an intended purpose.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use log::{debug, info};
use rand::Rng;
use serde::Serialize;
use std::fmt::Debug;
use std::{sync::Arc, time::Duration};

use crds::{
    EtcdCluster, EtcdClusterStatus, EtcdNode, EtcdNodeDeployment, EtcdNodeDeploymentStatus,
    EtcdNodeSet, EtcdNodeSetStatus, EtcdNodeStatus,
};

pub mod cluster;
pub mod config;
pub mod deployment;
pub mod expectations;
pub mod finalizer;
pub mod node;
pub mod nodeset;
pub mod pki;
pub mod probe;
pub mod secrets;
pub mod ssh;
pub mod store;
pub mod userdata;

#[cfg(test)]
mod mock_client;
#[cfg(test)]
mod mock_store;

use config::OperatorConfig;
use expectations::Expectations;
use probe::{HealthProbe, ProbeError};
use ssh::{RemoteShell, SshError};
use store::{ObjectStore, StoreError, StoreObject};

/// Backoff of every "not yet" condition that has no better estimate.
pub const WAIT_BACKOFF: Duration = Duration::from_secs(5);
pub const ERROR_REQUEUE: Duration = Duration::from_secs(60);

pub struct ContextData<S: ObjectStore> {
    pub store: S,
    pub expectations: Arc<Expectations>,
    pub shell: Arc<dyn RemoteShell>,
    pub prober: Arc<dyn HealthProbe>,
    pub config: Arc<OperatorConfig>,
}

impl<S: ObjectStore> Clone for ContextData<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            expectations: self.expectations.clone(),
            shell: self.shell.clone(),
            prober: self.prober.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A dependency is not there yet. Not a failure.
    #[error("waiting for {what}")]
    Waiting {
        what: String,
        delay: Option<Duration>,
    },
    #[error("{0}")]
    Conflict(StoreError),
    /// Retrying without a change to the object cannot succeed.
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl ControllerError {
    pub fn waiting(what: impl Into<String>) -> Self {
        ControllerError::Waiting {
            what: what.into(),
            delay: Some(WAIT_BACKOFF),
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, ControllerError::Waiting { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::Fatal(_))
    }
}

impl From<StoreError> for ControllerError {
    fn from(e: StoreError) -> Self {
        match e {
            e if e.is_conflict() => ControllerError::Conflict(e),
            e => ControllerError::Store(e),
        }
    }
}

pub fn controller_error_policy<R, C>(_obj: Arc<R>, error: &ControllerError, _ctx: Arc<C>) -> Action {
    match error {
        ControllerError::Waiting { what, delay } => {
            debug!("waiting for {what}");
            Action::requeue(delay.unwrap_or(Duration::ZERO))
        }
        ControllerError::Conflict(e) => {
            debug!("{e}, retrying");
            Action::requeue(Duration::ZERO)
        }
        e => {
            log::error!("{e}");
            Action::requeue(ERROR_REQUEUE)
        }
    }
}

pub async fn controller_info<T: Debug, E: Debug>(res: Result<T, E>) {
    match res {
        Ok(o) => info!("reconciled {o:?}"),
        Err(e) => debug!("reconcile failed: {e:?}"),
    }
}

/// Characters safe to put into generated names: no vowels, no look-alikes.
pub const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Maps every byte of `s` into [`SAFE_ALPHABET`].
pub fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHABET[b as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}

pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| SAFE_ALPHABET[rng.random_range(0..SAFE_ALPHABET.len())] as char)
        .collect()
}

pub fn name_or_default(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or("<no name>".to_string())
}

pub fn namespace_or_default(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or("default".to_string())
}

/// Fails when a name recorded in status is not the one this controller
/// derives. Someone else wrote it and it cannot be trusted.
pub fn check_reference(
    field: &str,
    recorded: &Option<String>,
    expected: &str,
) -> Result<(), ControllerError> {
    match recorded {
        Some(name) if name != expected => Err(ControllerError::Fatal(format!(
            "status.{field} is {name}, expected {expected}"
        ))),
        _ => Ok(()),
    }
}

/// Custom resources whose status is written by a reconciler.
pub trait HasStatus: StoreObject {
    type Status: Clone + Default + PartialEq + Debug + Serialize + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;

    /// Stored status, or the empty one if none was written yet.
    fn status_or_default(&self) -> Self::Status {
        self.status().cloned().unwrap_or_default()
    }
}

macro_rules! has_status {
    ($kind:ty, $status:ty) => {
        impl HasStatus for $kind {
            type Status = $status;

            fn status(&self) -> Option<&$status> {
                self.status.as_ref()
            }
        }
    };
}

has_status!(EtcdCluster, EtcdClusterStatus);
has_status!(EtcdNode, EtcdNodeStatus);
has_status!(EtcdNodeSet, EtcdNodeSetStatus);
has_status!(EtcdNodeDeployment, EtcdNodeDeploymentStatus);

/// Writes `status` if it differs from what `obj` carries and returns the
/// updated object. The patch is guarded by the object's resourceVersion. An
/// object that is gone is not an error: it was released and collected during
/// the pass.
pub async fn persist_status<S: ObjectStore, K: HasStatus>(
    store: &S,
    obj: &K,
    status: &K::Status,
) -> Result<Option<K>, ControllerError> {
    if obj.status_or_default() == *status {
        return Ok(None);
    }
    let meta = obj.meta();
    let name = name_or_default(meta);
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": meta.resource_version },
        "status": status,
    });
    match store
        .patch_status::<K>(&namespace_or_default(meta), &name, &patch)
        .await
    {
        Ok(updated) => Ok(Some(updated)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persists the status computed during a pass, whether or not the pass
/// succeeded. The pass error wins over a status write error.
pub async fn finish_reconcile<S: ObjectStore, K: HasStatus>(
    store: &S,
    obj: &K,
    status: &K::Status,
    result: Result<Action, ControllerError>,
) -> Result<Action, ControllerError> {
    let persisted = persist_status(store, obj, status).await;
    let action = result?;
    persisted?;
    Ok(action)
}
