// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crds::{
    ANNOTATION_DESIRED_REPLICAS, ANNOTATION_MAX_REPLICAS, ANNOTATION_REVISION,
    ANNOTATION_REVISION_HISTORY, EtcdNodeDeployment, EtcdNodeDeploymentSpec,
    EtcdNodeDeploymentStatus, EtcdNodeSet, EtcdNodeTemplate, LABEL_TEMPLATE_HASH,
};

use crate::{ControllerError, safe_encode};

/// Longest revision history annotation value kept on a Node-Set.
pub const MAX_REVISION_HISTORY_CHARS: usize = 2000;
pub const DEFAULT_FENCEPOST: &str = "25%";
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Bookkeeping annotations that belong to the set, not to the deployment.
fn skip_copy_annotation(key: &str) -> bool {
    [
        LAST_APPLIED_ANNOTATION,
        ANNOTATION_REVISION,
        ANNOTATION_REVISION_HISTORY,
        ANNOTATION_DESIRED_REPLICAS,
        ANNOTATION_MAX_REPLICAS,
    ]
    .contains(&key)
}

/// JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Short name-safe digest of a node template, salted with the collision count.
pub fn template_hash(
    template: &EtcdNodeTemplate,
    collision_count: Option<i32>,
) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(template)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    if let Some(count) = collision_count {
        hasher.update((count as u32).to_le_bytes());
    }
    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(safe_encode(&prefix.to_string()))
}

/// Template equality, ignoring the template hash label.
pub fn equal_ignore_hash(a: &EtcdNodeTemplate, b: &EtcdNodeTemplate) -> bool {
    let strip = |t: &EtcdNodeTemplate| {
        let mut t = t.clone();
        t.metadata.labels.remove(LABEL_TEMPLATE_HASH);
        t
    };
    strip(a) == strip(b)
}

/// Resolves an absolute or percentage value against `total`.
pub fn scaled_value(value: &IntOrString, total: i32, round_up: bool) -> Result<i32, ControllerError> {
    match value {
        IntOrString::Int(v) => Ok(*v),
        IntOrString::String(s) => {
            let percent: i32 = s
                .strip_suffix('%')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| ControllerError::Fatal(format!("invalid value for IntOrString: {s}")))?;
            let scaled = f64::from(percent) * f64::from(total) / 100.0;
            Ok(match round_up {
                true => scaled.ceil() as i32,
                false => scaled.floor() as i32,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fenceposts {
    pub max_surge: i32,
    pub max_unavailable: i32,
}

/// Surge rounds up and unavailability down. Both resolving to zero would
/// stall the rollout, so one node may then be unavailable.
pub fn resolve_fenceposts(spec: &EtcdNodeDeploymentSpec) -> Result<Fenceposts, ControllerError> {
    let replicas = spec.replicas();
    let rolling = spec.strategy.rolling_update.clone().unwrap_or_default();
    let default = IntOrString::String(DEFAULT_FENCEPOST.to_string());
    let max_surge = scaled_value(rolling.max_surge.as_ref().unwrap_or(&default), replicas, true)?;
    let mut max_unavailable =
        scaled_value(rolling.max_unavailable.as_ref().unwrap_or(&default), replicas, false)?;
    if max_surge == 0 && max_unavailable == 0 {
        max_unavailable = 1;
    }
    Ok(Fenceposts {
        max_surge,
        max_unavailable: max_unavailable.min(replicas.max(0)),
    })
}

fn annotation<'a>(set: &'a EtcdNodeSet, key: &str) -> Option<&'a str> {
    set.meta().annotations.as_ref()?.get(key).map(String::as_str)
}

pub fn revision(set: &EtcdNodeSet) -> i64 {
    annotation(set, ANNOTATION_REVISION)
        .and_then(|r| r.parse().ok())
        .unwrap_or(0)
}

pub fn max_revision<'a>(sets: impl IntoIterator<Item = &'a EtcdNodeSet>) -> i64 {
    sets.into_iter().map(revision).max().unwrap_or(0)
}

pub fn desired_replicas_annotation(set: &EtcdNodeSet) -> Option<i32> {
    annotation(set, ANNOTATION_DESIRED_REPLICAS)?.parse().ok()
}

pub fn max_replicas_annotation(set: &EtcdNodeSet) -> Option<i32> {
    annotation(set, ANNOTATION_MAX_REPLICAS)?.parse().ok()
}

pub fn replicas_annotations_need_update(set: &EtcdNodeSet, desired: i32, max: i32) -> bool {
    annotation(set, ANNOTATION_DESIRED_REPLICAS) != Some(desired.to_string().as_str())
        || annotation(set, ANNOTATION_MAX_REPLICAS) != Some(max.to_string().as_str())
}

fn set_annotation(annotations: &mut BTreeMap<String, String>, key: &str, value: String) -> bool {
    match annotations.get(key) {
        Some(existing) if *existing == value => false,
        _ => {
            annotations.insert(key.to_string(), value);
            true
        }
    }
}

pub fn set_replicas_annotations(set: &mut EtcdNodeSet, desired: i32, max: i32) -> bool {
    let annotations = set.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let desired_changed = set_annotation(annotations, ANNOTATION_DESIRED_REPLICAS, desired.to_string());
    let max_changed = set_annotation(annotations, ANNOTATION_MAX_REPLICAS, max.to_string());
    desired_changed || max_changed
}

fn copy_deployment_annotations(deployment: &EtcdNodeDeployment, set: &mut EtcdNodeSet) -> bool {
    let annotations = set.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in deployment.meta().annotations.iter().flatten() {
        if !skip_copy_annotation(k) {
            changed |= set_annotation(annotations, k, v.clone());
        }
    }
    changed
}

/// Appends `old` to a comma-joined history, dropping the oldest entries
/// until the result fits. `None` when even `old` alone does not fit.
pub fn append_revision_history(history: &str, old: &str) -> Option<String> {
    if history.is_empty() {
        return Some(old.to_string());
    }
    let revisions: Vec<&str> = history.split(',').collect();
    let mut total = history.len() + old.len() + 1;
    let mut start = 0;
    while total > MAX_REVISION_HISTORY_CHARS && start < revisions.len() {
        total -= revisions[start].len() + 1;
        start += 1;
    }
    (total <= MAX_REVISION_HISTORY_CHARS).then(|| {
        let mut kept = revisions[start..].to_vec();
        kept.push(old);
        kept.join(",")
    })
}

/// Brings the bookkeeping annotations of the new set up to date. `exists`
/// is false for a set about to be created, which also gets its replica
/// annotations. Returns whether anything changed.
pub fn set_new_set_annotations(
    deployment: &EtcdNodeDeployment,
    set: &mut EtcdNodeSet,
    new_revision: i64,
    exists: bool,
    max_surge: i32,
) -> bool {
    let mut changed = copy_deployment_annotations(deployment, set);
    let annotations = set.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let old_revision = annotations.get(ANNOTATION_REVISION).cloned();
    let old_revision_value = match old_revision.as_deref().map(str::parse::<i64>) {
        None => 0,
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            log::warn!(
                "Ignoring unparsable revision {:?} of EtcdNodeSet {:?}",
                old_revision,
                set.metadata.name
            );
            return false;
        }
    };
    if old_revision_value < new_revision {
        annotations.insert(ANNOTATION_REVISION.to_string(), new_revision.to_string());
        changed = true;
        // A set that already carried a revision is being rolled back to.
        if let Some(old) = &old_revision {
            let history = annotations
                .get(ANNOTATION_REVISION_HISTORY)
                .cloned()
                .unwrap_or_default();
            match append_revision_history(&history, old) {
                Some(h) => {
                    annotations.insert(ANNOTATION_REVISION_HISTORY.to_string(), h);
                }
                None => log::warn!("Revision history of EtcdNodeSet {:?} is full", set.metadata.name),
            }
        }
    }
    let replicas = deployment.spec.replicas();
    if !exists {
        changed |= set_replicas_annotations(set, replicas, replicas + max_surge);
    }
    changed
}

/// Replicas of a set about to be scaled up, bounded by the surge allowance.
pub fn new_set_replicas(
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    all: &[&EtcdNodeSet],
    new: &EtcdNodeSet,
) -> i32 {
    let replicas = deployment.spec.replicas();
    let current: i32 = all.iter().map(|s| s.spec.replicas()).sum();
    let max_total = replicas + fenceposts.max_surge;
    let new_replicas = new.spec.replicas();
    if current >= max_total {
        return new_replicas;
    }
    let scale_up = (max_total - current).min(replicas - new_replicas);
    new_replicas + scale_up
}

pub fn is_active(set: &EtcdNodeSet) -> bool {
    set.spec.replicas() > 0
}

pub fn available(set: &EtcdNodeSet) -> i32 {
    set.status.as_ref().map_or(0, |s| s.available_replicas)
}

/// The new set already runs everything the deployment asks for.
pub fn is_saturated(deployment: &EtcdNodeDeployment, set: &EtcdNodeSet) -> bool {
    let replicas = deployment.spec.replicas();
    desired_replicas_annotation(set) == Some(replicas)
        && set.spec.replicas() == replicas
        && available(set) == replicas
}

/// Share of a proportional scale that falls onto `set`.
fn set_fraction(set: &EtcdNodeSet, deployment: &EtcdNodeDeployment, fenceposts: Fenceposts) -> i32 {
    let replicas = set.spec.replicas();
    if deployment.spec.replicas() == 0 {
        return -replicas;
    }
    let deployment_replicas = deployment.spec.replicas() + fenceposts.max_surge;
    let annotated = max_replicas_annotation(set)
        .unwrap_or_else(|| deployment.status.as_ref().map_or(0, |s| s.replicas));
    if annotated == 0 {
        return 0;
    }
    let size = f64::from(replicas) * f64::from(deployment_replicas) / f64::from(annotated);
    size.round() as i32 - replicas
}

pub fn proportion(
    set: &EtcdNodeSet,
    deployment: &EtcdNodeDeployment,
    fenceposts: Fenceposts,
    to_add: i32,
    added: i32,
) -> i32 {
    if set.spec.replicas() == 0 || to_add == 0 || to_add == added {
        return 0;
    }
    let fraction = set_fraction(set, deployment, fenceposts);
    let allowed = to_add - added;
    match to_add > 0 {
        true => fraction.min(allowed),
        false => fraction.max(allowed),
    }
}

fn created(set: &EtcdNodeSet) -> Option<DateTime<Utc>> {
    set.meta().creation_timestamp.as_ref().map(|t| t.0)
}

/// Oldest first, ties by name.
pub fn by_creation(a: &EtcdNodeSet, b: &EtcdNodeSet) -> Ordering {
    created(a)
        .cmp(&created(b))
        .then_with(|| a.meta().name.cmp(&b.meta().name))
}

pub fn by_revision(a: &EtcdNodeSet, b: &EtcdNodeSet) -> Ordering {
    revision(a).cmp(&revision(b)).then_with(|| by_creation(a, b))
}

/// Largest first, ties oldest first.
pub fn by_size_older(a: &EtcdNodeSet, b: &EtcdNodeSet) -> Ordering {
    b.spec.replicas().cmp(&a.spec.replicas()).then_with(|| by_creation(a, b))
}

/// Largest first, ties newest first.
pub fn by_size_newer(a: &EtcdNodeSet, b: &EtcdNodeSet) -> Ordering {
    b.spec.replicas().cmp(&a.spec.replicas()).then_with(|| by_creation(b, a))
}

/// Every node runs the current template, is available, and the status
/// reflects the latest spec.
pub fn deployment_complete(deployment: &EtcdNodeDeployment, status: &EtcdNodeDeploymentStatus) -> bool {
    let replicas = deployment.spec.replicas();
    status.updated_replicas == replicas
        && status.replicas == replicas
        && status.available_replicas == replicas
        && status.observed_generation >= deployment.meta().generation.unwrap_or_default()
}
