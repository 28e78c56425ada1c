// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use kube::Resource;
use kube::api::ObjectMeta;
use log::{info, warn};
use std::collections::BTreeMap;

use crds::{
    ANNOTATION_DESIRED_REPLICAS, ANNOTATION_MAX_REPLICAS, EtcdNodeDeployment, EtcdNodeSet,
    EtcdNodeSetSpec, LABEL_TEMPLATE_HASH,
};

use super::SetState;
use super::util::{
    Fenceposts, by_creation, by_revision, by_size_newer, by_size_older, equal_ignore_hash,
    is_active, is_saturated, max_revision, new_set_replicas, proportion,
    replicas_annotations_need_update, set_new_set_annotations, template_hash,
};
use crate::store::{ObjectStore, StoreError, is_controlled_by, object_key, owner_reference};
use crate::{ContextData, ControllerError, HasStatus, name_or_default, namespace_or_default};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewSet {
    Synced,
    /// A foreign set holds the name derived from the template hash.
    Collided,
}

/// Finds the set running the current template and brings its bookkeeping
/// annotations up to date. When there is none and `create` is set, creates
/// it with the replicas the surge allowance permits.
pub async fn sync_new_set<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
    create: bool,
) -> Result<NewSet, ControllerError> {
    let namespace = namespace_or_default(deployment.meta());
    let new_revision = max_revision(&state.old) + 1;

    if let Some(existing) = &state.new {
        let mut set = existing.clone();
        if set_new_set_annotations(deployment, &mut set, new_revision, true, fenceposts.max_surge) {
            state.new = Some(ctx.store.replace(&namespace, &set).await?);
        }
        return Ok(NewSet::Synced);
    }
    if !create {
        return Ok(NewSet::Synced);
    }

    let hash = template_hash(&deployment.spec.template, state.collision_count).map_err(StoreError::from)?;
    let name = format!("{}-{hash}", name_or_default(deployment.meta()));
    let mut template = deployment.spec.template.clone();
    template
        .metadata
        .labels
        .insert(LABEL_TEMPLATE_HASH.to_string(), hash.clone());
    let mut selector = deployment.spec.selector.clone();
    selector
        .match_labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_TEMPLATE_HASH.to_string(), hash);

    let mut set = EtcdNodeSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(template.metadata.labels.clone()),
            owner_references: owner_reference(deployment).map(|o| vec![o]),
            ..Default::default()
        },
        spec: EtcdNodeSetSpec {
            replicas: Some(0),
            selector,
            template,
        },
        status: None,
    };
    let all: Vec<&EtcdNodeSet> = state.old.iter().chain(std::iter::once(&set)).collect();
    let replicas = new_set_replicas(deployment, fenceposts, &all, &set);
    set.spec.replicas = Some(replicas);
    set_new_set_annotations(deployment, &mut set, new_revision, false, fenceposts.max_surge);

    match ctx.store.create(&namespace, &set).await {
        Ok(created) => {
            info!("Created EtcdNodeSet {namespace}/{name} with {replicas} replicas at revision {new_revision}");
            state.new = Some(created);
            Ok(NewSet::Synced)
        }
        Err(e) if e.is_already_exists() => {
            let existing: EtcdNodeSet = ctx.store.get(&namespace, &name).await?;
            let ours = deployment
                .meta()
                .uid
                .as_deref()
                .is_some_and(|uid| is_controlled_by(&existing, uid));
            if ours && equal_ignore_hash(&deployment.spec.template, &existing.spec.template) {
                state.new = Some(existing);
                return Ok(NewSet::Synced);
            }
            let count = state.collision_count.unwrap_or(0) + 1;
            state.collision_count = Some(count);
            warn!(
                "Hash collision on EtcdNodeSet {namespace}/{name}, collisionCount of {} is now {count}",
                object_key(deployment)
            );
            Ok(NewSet::Collided)
        }
        Err(e) => Err(e.into()),
    }
}

/// Sets the size of `set` and stamps the deployment's replica annotations.
pub async fn scale_set<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    set: &EtcdNodeSet,
    new_scale: i32,
) -> Result<EtcdNodeSet, ControllerError> {
    let replicas = deployment.spec.replicas();
    let max = replicas + fenceposts.max_surge;
    let size_changed = set.spec.replicas() != new_scale;
    if !size_changed && !replicas_annotations_need_update(set, replicas, max) {
        return Ok(set.clone());
    }
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": set.meta().resource_version,
            "annotations": {
                ANNOTATION_DESIRED_REPLICAS: replicas.to_string(),
                ANNOTATION_MAX_REPLICAS: max.to_string(),
            },
        },
        "spec": { "replicas": new_scale },
    });
    let updated = ctx
        .store
        .patch::<EtcdNodeSet>(&namespace_or_default(set.meta()), &name_or_default(set.meta()), &patch)
        .await?;
    if size_changed {
        info!(
            "Scaled EtcdNodeSet {} from {} to {new_scale}",
            object_key(set),
            set.spec.replicas()
        );
    }
    Ok(updated)
}

/// Scales only when the size differs. Returns whether it did.
pub async fn scale_set_if_needed<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    set: &EtcdNodeSet,
    new_scale: i32,
) -> Result<(bool, EtcdNodeSet), ControllerError> {
    if set.spec.replicas() == new_scale {
        return Ok((false, set.clone()));
    }
    let updated = scale_set(ctx, deployment, fenceposts, set, new_scale).await?;
    Ok((true, updated))
}

/// The only set with nodes, or the latest one if none has any. `None`
/// when several sets carry nodes.
fn active_or_latest(state: &SetState) -> Option<EtcdNodeSet> {
    if state.new.is_none() && state.old.is_empty() {
        return None;
    }
    let mut old: Vec<&EtcdNodeSet> = state.old.iter().collect();
    old.sort_by(|a, b| by_creation(b, a));
    let active: Vec<&EtcdNodeSet> = old
        .iter()
        .copied()
        .chain(state.new.iter())
        .filter(|s| is_active(s))
        .collect();
    match active.len() {
        0 => state.new.as_ref().or(old.first().copied()).cloned(),
        1 => Some(active[0].clone()),
        _ => None,
    }
}

/// Handles a change of `spec.replicas`. With a rollout in flight the
/// change is spread over every active set in proportion to its size.
pub async fn scale<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
) -> Result<(), ControllerError> {
    let replicas = deployment.spec.replicas();
    if let Some(target) = active_or_latest(state) {
        if target.spec.replicas() != replicas {
            let updated = scale_set(ctx, deployment, fenceposts, &target, replicas).await?;
            state.update(updated);
        }
        return Ok(());
    }

    if state.new.as_ref().is_some_and(|n| is_saturated(deployment, n)) {
        let old: Vec<EtcdNodeSet> = state.old.iter().filter(|s| is_active(s)).cloned().collect();
        for set in old {
            let updated = scale_set(ctx, deployment, fenceposts, &set, 0).await?;
            state.update(updated);
        }
        return Ok(());
    }

    let mut active: Vec<EtcdNodeSet> = state.all().filter(|s| is_active(s)).cloned().collect();
    let current: i32 = active.iter().map(|s| s.spec.replicas()).sum();
    let allowed = match replicas > 0 {
        true => replicas + fenceposts.max_surge,
        false => 0,
    };
    let to_add = allowed - current;
    if to_add > 0 {
        active.sort_by(by_size_newer);
    } else if to_add < 0 {
        active.sort_by(by_size_older);
    }

    let mut added = 0;
    let mut sizes: Vec<i32> = active
        .iter()
        .map(|set| {
            let share = proportion(set, deployment, fenceposts, to_add, added);
            added += share;
            set.spec.replicas() + share
        })
        .collect();
    if to_add != 0 {
        if let Some(first) = sizes.first_mut() {
            *first = (*first + to_add - added).max(0);
        }
    }
    for (set, size) in active.iter().zip(sizes) {
        let updated = scale_set(ctx, deployment, fenceposts, set, size).await?;
        state.update(updated);
    }
    Ok(())
}

/// Deletes retired sets beyond the revision history limit, oldest revision
/// first. Sets that still have nodes, or whose status lags their spec, stay.
pub async fn cleanup_history<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    state: &SetState,
) -> Result<(), ControllerError> {
    let Some(limit) = deployment.spec.revision_history_limit else {
        return Ok(());
    };
    let mut cleanable: Vec<&EtcdNodeSet> = state
        .old
        .iter()
        .filter(|s| s.meta().deletion_timestamp.is_none())
        .collect();
    let diff = cleanable.len() as i64 - i64::from(limit.max(0));
    if diff <= 0 {
        return Ok(());
    }
    cleanable.sort_by(|a, b| by_revision(a, b));

    for set in cleanable.into_iter().take(diff as usize) {
        let status = set.status_or_default();
        let generation = set.meta().generation.unwrap_or_default();
        if status.replicas != 0 || set.spec.replicas() != 0 || generation > status.observed_generation {
            continue;
        }
        info!("Trimming EtcdNodeSet {} from the revision history", object_key(set));
        match ctx
            .store
            .delete::<EtcdNodeSet>(&namespace_or_default(set.meta()), &name_or_default(set.meta()))
            .await
        {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => {}
        }
    }
    Ok(())
}
