// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use kube::runtime::controller::Action;

use crds::{EtcdNodeDeployment, EtcdNodeSet};

use super::SetState;
use super::sync::{cleanup_history, scale_set_if_needed};
use super::util::{Fenceposts, available, by_creation, deployment_complete, is_active, new_set_replicas};
use crate::store::{ObjectStore, object_key};
use crate::{ContextData, ControllerError};

/// One step of a rolling update: grow the new set, otherwise shrink the old
/// ones, otherwise trim the history once the rollout is complete.
pub async fn rollout<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
) -> Result<Action, ControllerError> {
    if reconcile_new_set(ctx, deployment, fenceposts, state).await? {
        return Ok(Action::await_change());
    }
    if reconcile_old_sets(ctx, deployment, fenceposts, state).await? {
        return Ok(Action::await_change());
    }
    if deployment_complete(deployment, &state.status(deployment)) {
        cleanup_history(ctx, deployment, state).await?;
    }
    Ok(Action::await_change())
}

async fn reconcile_new_set<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
) -> Result<bool, ControllerError> {
    let Some(new) = state.new.clone() else {
        return Ok(false);
    };
    let replicas = deployment.spec.replicas();
    let target = match new.spec.replicas() {
        current if current == replicas => return Ok(false),
        current if current > replicas => replicas,
        _ => {
            let all: Vec<&EtcdNodeSet> = state.all().collect();
            new_set_replicas(deployment, fenceposts, &all, &new)
        }
    };
    let (scaled, updated) = scale_set_if_needed(ctx, deployment, fenceposts, &new, target).await?;
    state.update(updated);
    Ok(scaled)
}

async fn reconcile_old_sets<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
) -> Result<bool, ControllerError> {
    let old_count: i32 = state.old.iter().map(|s| s.spec.replicas()).sum();
    if old_count == 0 {
        return Ok(false);
    }
    let all_count: i32 = state.all().map(|s| s.spec.replicas()).sum();
    let min_available = deployment.spec.replicas() - fenceposts.max_unavailable;
    let new_unavailable = state
        .new
        .as_ref()
        .map_or(0, |n| n.spec.replicas() - available(n));
    let max_scaled_down = all_count - min_available - new_unavailable;
    if max_scaled_down <= 0 {
        return Ok(false);
    }

    let cleaned = cleanup_unhealthy(ctx, deployment, fenceposts, state, max_scaled_down).await?;
    let scaled_down = scale_down_old(ctx, deployment, fenceposts, state).await?;
    Ok(cleaned + scaled_down > 0)
}

fn active_old_by_age(state: &SetState) -> Vec<EtcdNodeSet> {
    let mut old: Vec<EtcdNodeSet> = state.old.iter().filter(|s| is_active(s)).cloned().collect();
    old.sort_by(by_creation);
    old
}

/// Drops the unavailable nodes of old sets, oldest set first.
async fn cleanup_unhealthy<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
    max_cleanup: i32,
) -> Result<i32, ControllerError> {
    let mut total = 0;
    for set in active_old_by_age(state) {
        if total >= max_cleanup {
            break;
        }
        let replicas = set.spec.replicas();
        let healthy = available(&set);
        if replicas == healthy {
            continue;
        }
        let count = (max_cleanup - total).min(replicas - healthy);
        let new_replicas = replicas - count;
        if new_replicas > replicas {
            return Err(anyhow::anyhow!(
                "invalid request to scale EtcdNodeSet {} from {replicas} to {new_replicas} while cleaning up unhealthy nodes",
                object_key(&set)
            )
            .into());
        }
        let (_, updated) = scale_set_if_needed(ctx, deployment, fenceposts, &set, new_replicas).await?;
        state.update(updated);
        total += count;
    }
    Ok(total)
}

/// Scales old sets down, oldest first, as far as the availability floor
/// allows.
async fn scale_down_old<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    state: &mut SetState,
) -> Result<i32, ControllerError> {
    let min_available = deployment.spec.replicas() - fenceposts.max_unavailable;
    let available_count: i32 = state.all().map(available).sum();
    if available_count <= min_available {
        return Ok(0);
    }
    let target = available_count - min_available;
    let mut total = 0;
    for set in active_old_by_age(state) {
        if total >= target {
            break;
        }
        let count = set.spec.replicas().min(target - total);
        let (_, updated) =
            scale_set_if_needed(ctx, deployment, fenceposts, &set, set.spec.replicas() - count).await?;
        state.update(updated);
        total += count;
    }
    Ok(total)
}
