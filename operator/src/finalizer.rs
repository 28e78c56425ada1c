// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Finalizer handling shared by the cluster and node controllers.

use kube::Resource;
use kube::runtime::controller::Action;
use log::info;
use std::time::Duration;

use crate::store::{ObjectStore, StoreObject, get_opt};
use crate::{ControllerError, WAIT_BACKOFF, name_or_default, namespace_or_default};

const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Terminating,
}

pub fn lifecycle<K: Resource>(obj: &K) -> Lifecycle {
    match obj.meta().deletion_timestamp {
        Some(_) => Lifecycle::Terminating,
        None => Lifecycle::Active,
    }
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == finalizer)
}

/// What a reconciler should do with an object after finalizer bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reconcile,
    Finalize,
    /// Nothing else to do this pass.
    Done(Action),
}

/// Adds `finalizer` to live objects and reports whether the object is to be
/// reconciled or finalized.
pub async fn ensure_finalizer<S: ObjectStore, K: StoreObject>(
    store: &S,
    obj: &K,
    finalizer: &str,
) -> Result<Step, ControllerError> {
    match (lifecycle(obj), has_finalizer(obj, finalizer)) {
        (Lifecycle::Active, false) => {
            let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
            finalizers.push(finalizer.to_string());
            patch_finalizers(store, obj, finalizers).await?;
            info!(
                "Added finalizer {finalizer} to {} {}",
                K::kind(&()),
                name_or_default(obj.meta())
            );
            Ok(Step::Done(Action::requeue(FINALIZER_REQUEUE)))
        }
        (Lifecycle::Active, true) => Ok(Step::Reconcile),
        (Lifecycle::Terminating, true) => Ok(Step::Finalize),
        (Lifecycle::Terminating, false) => Ok(Step::Done(Action::await_change())),
    }
}

/// Releases the object once finalization has completed.
pub async fn remove_finalizer<S: ObjectStore, K: StoreObject>(
    store: &S,
    obj: &K,
    finalizer: &str,
) -> Result<Action, ControllerError> {
    if has_finalizer(obj, finalizer) {
        let finalizers = obj
            .meta()
            .finalizers
            .iter()
            .flatten()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        match patch_finalizers(store, obj, finalizers).await {
            Err(ControllerError::Store(e)) if e.is_not_found() => {}
            r => r?,
        }
        info!(
            "Removed finalizer {finalizer} from {} {}",
            K::kind(&()),
            name_or_default(obj.meta())
        );
    }
    Ok(Action::requeue(FINALIZER_REQUEUE))
}

async fn patch_finalizers<S: ObjectStore, K: StoreObject>(
    store: &S,
    obj: &K,
    finalizers: Vec<String>,
) -> Result<(), ControllerError> {
    let meta = obj.meta();
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": meta.resource_version,
        }
    });
    store
        .patch::<K>(&namespace_or_default(meta), &name_or_default(meta), &patch)
        .await?;
    Ok(())
}

/// Deletes the named object and succeeds only once it is gone.
pub async fn delete_and_wait<S: ObjectStore, K: StoreObject>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<(), ControllerError> {
    let Some(obj) = get_opt::<S, K>(store, namespace, name).await? else {
        return Ok(());
    };
    if lifecycle(&obj) == Lifecycle::Active {
        match store.delete::<K>(namespace, name).await {
            Ok(()) => info!("Delete {} {namespace}/{name}", K::kind(&())),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Err(ControllerError::Waiting {
        what: format!("{} {namespace}/{name} to be deleted", K::kind(&())),
        delay: Some(WAIT_BACKOFF),
    })
}
