// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Keeps the number of nodes owned by a Node-Set at its desired count.

use futures_util::{StreamExt, stream};
use kube::api::ObjectMeta;
use kube::runtime::{
    WatchStreamExt,
    controller::{Action, Controller},
    watcher,
};
use kube::{Api, Resource};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crds::conditions::{READY_CONDITION, is_condition_true};
use crds::{EtcdNode, EtcdNodeSet, EtcdNodeSetStatus};

use crate::expectations::Expectations;
use crate::store::{
    KubeStore, ObjectStore, StoreError, list_controlled, object_key, owner_reference,
};
use crate::{
    ContextData, ControllerError, controller_error_policy, controller_info, finish_reconcile,
    name_or_default, namespace_or_default, random_suffix,
};

mod ranking;

pub use ranking::rank_for_deletion;

const EXPECTATIONS_REQUEUE: Duration = Duration::from_secs(1);
const NAME_SUFFIX_LEN: usize = 5;

fn is_active(node: &EtcdNode) -> bool {
    node.meta().deletion_timestamp.is_none()
}

fn is_ready(node: &EtcdNode) -> bool {
    node.status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, READY_CONDITION))
}

async fn owned_nodes<S: ObjectStore>(
    ctx: &ContextData<S>,
    set: &EtcdNodeSet,
) -> Result<Vec<EtcdNode>, ControllerError> {
    let Some(uid) = set.meta().uid.as_deref() else {
        return Ok(vec![]);
    };
    let namespace = namespace_or_default(set.meta());
    Ok(list_controlled(&ctx.store, &namespace, &set.spec.selector, uid).await?)
}

fn node_from_template(set: &EtcdNodeSet, name: String) -> EtcdNode {
    let template = &set.spec.template;
    let mut spec = template.spec.clone();
    spec.is_first_node = false;
    EtcdNode {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: set.meta().namespace.clone(),
            labels: Some(template.metadata.labels.clone()),
            annotations: (!template.metadata.annotations.is_empty())
                .then(|| template.metadata.annotations.clone()),
            owner_references: owner_reference(set).map(|o| vec![o]),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Returns the first error after every operation has finished.
fn first_error(results: Vec<Result<(), StoreError>>) -> Result<(), ControllerError> {
    match results.into_iter().find_map(Result::err) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn create_nodes<S: ObjectStore>(
    ctx: &ContextData<S>,
    set: &EtcdNodeSet,
    key: &str,
    count: usize,
) -> Result<(), ControllerError> {
    let namespace = namespace_or_default(set.meta());
    let name = name_or_default(set.meta());
    ctx.expectations.expect_creations(key, count);
    info!("Creating {count} nodes for EtcdNodeSet {key}");

    let nodes: Vec<EtcdNode> = (0..count)
        .map(|_| node_from_template(set, format!("{name}-{}", random_suffix(NAME_SUFFIX_LEN))))
        .collect();
    let results: Vec<Result<(), StoreError>> = stream::iter(nodes)
        .map(|node| {
            let namespace = namespace.clone();
            async move {
                let result = ctx.store.create(&namespace, &node).await.map(|_| ());
                if let Err(e) = &result {
                    warn!("Failed to create node for EtcdNodeSet {key}: {e}");
                    ctx.expectations.creation_observed(key);
                }
                result
            }
        })
        .buffer_unordered(ctx.config.node_set_burst.max(1))
        .collect()
        .await;
    first_error(results)
}

async fn delete_nodes<S: ObjectStore>(
    ctx: &ContextData<S>,
    key: &str,
    victims: Vec<&EtcdNode>,
) -> Result<(), ControllerError> {
    let keys: Vec<String> = victims.iter().map(|n| object_key(*n)).collect();
    ctx.expectations.expect_deletions(key, keys.iter().cloned());
    info!("Deleting {} nodes of EtcdNodeSet {key}", victims.len());

    let deletions: Vec<_> = victims
        .into_iter()
        .zip(keys)
        .map(|(node, node_key)| async move {
            let namespace = namespace_or_default(node.meta());
            match ctx
                .store
                .delete::<EtcdNode>(&namespace, &name_or_default(node.meta()))
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => {
                    ctx.expectations.deletion_observed(key, &node_key);
                    if e.is_not_found() {
                        return Ok(());
                    }
                    warn!("Failed to delete node {node_key}: {e}");
                    Err(e)
                }
            }
        })
        .collect();
    let results: Vec<Result<(), StoreError>> = stream::iter(deletions)
        .buffer_unordered(ctx.config.node_set_burst.max(1))
        .collect()
        .await;
    first_error(results)
}

async fn manage_nodes<S: ObjectStore>(
    ctx: &ContextData<S>,
    set: &EtcdNodeSet,
    key: &str,
    active: &[&EtcdNode],
) -> Result<bool, ControllerError> {
    let diff = active.len() as i64 - i64::from(set.spec.replicas().max(0));
    match diff {
        d if d < 0 => create_nodes(ctx, set, key, d.unsigned_abs() as usize).await?,
        d if d > 0 => {
            let victims = rank_for_deletion(active, chrono::Utc::now())
                .into_iter()
                .take(d as usize)
                .collect();
            delete_nodes(ctx, key, victims).await?
        }
        _ => return Ok(false),
    }
    Ok(true)
}

pub fn calculate_status(set: &EtcdNodeSet, nodes: &[EtcdNode]) -> EtcdNodeSetStatus {
    let active: Vec<&EtcdNode> = nodes.iter().filter(|n| is_active(n)).collect();
    let ready = active.iter().filter(|n| is_ready(n)).count() as i32;
    EtcdNodeSetStatus {
        replicas: nodes.len() as i32,
        active_replicas: active.len() as i32,
        ready_replicas: ready,
        available_replicas: ready,
        observed_generation: set.meta().generation.unwrap_or_default(),
    }
}

pub async fn reconcile<S: ObjectStore>(
    set: Arc<EtcdNodeSet>,
    ctx: Arc<ContextData<S>>,
) -> Result<Action, ControllerError> {
    let key = object_key(set.as_ref());
    if set.meta().deletion_timestamp.is_some() {
        ctx.expectations.delete_expectations(&key);
        return Ok(Action::await_change());
    }

    let satisfied = ctx.expectations.satisfied(&key);
    let mut nodes = owned_nodes(&ctx, &set).await?;
    let result = match satisfied {
        true => {
            let outcome = {
                let active: Vec<&EtcdNode> = nodes.iter().filter(|n| is_active(n)).collect();
                manage_nodes(&ctx, &set, &key, &active).await
            };
            if !matches!(outcome, Ok(false)) {
                match owned_nodes(&ctx, &set).await {
                    Ok(listed) => nodes = listed,
                    Err(e) => warn!("Failed to list nodes of EtcdNodeSet {key} after scaling: {e}"),
                }
            }
            outcome.map(|_| Action::requeue(ctx.config.resync_interval()))
        }
        false => {
            debug!("EtcdNodeSet {key} has pending expectations {:?}", ctx.expectations.pending(&key));
            Ok(Action::requeue(EXPECTATIONS_REQUEUE))
        }
    };
    let status = calculate_status(&set, &nodes);
    finish_reconcile(&ctx.store, set.as_ref(), &status, result).await
}

/// Feeds node watch events into the expectations of their owning sets.
pub struct NodeEventObserver {
    expectations: Arc<Expectations>,
    seen: HashSet<String>,
}

impl NodeEventObserver {
    pub fn new(expectations: Arc<Expectations>) -> Self {
        Self {
            expectations,
            seen: HashSet::new(),
        }
    }

    fn owner_key(node: &EtcdNode) -> Option<String> {
        let owner = node
            .meta()
            .owner_references
            .iter()
            .flatten()
            .find(|r| r.controller == Some(true) && r.kind == EtcdNodeSet::kind(&()))?;
        Some(format!("{}/{}", namespace_or_default(node.meta()), owner.name))
    }

    fn applied(&mut self, node: &EtcdNode) {
        let (Some(owner), Some(uid)) = (Self::owner_key(node), node.meta().uid.clone()) else {
            return;
        };
        if !is_active(node) {
            self.expectations.deletion_observed(&owner, &object_key(node));
        } else if self.seen.insert(uid) {
            self.expectations.creation_observed(&owner);
        }
    }

    fn deleted(&mut self, node: &EtcdNode) {
        if let Some(uid) = &node.meta().uid {
            self.seen.remove(uid);
        }
        if let Some(owner) = Self::owner_key(node) {
            self.expectations.deletion_observed(&owner, &object_key(node));
        }
    }

    pub fn observe(&mut self, event: &watcher::Event<EtcdNode>) {
        match event {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => self.applied(node),
            watcher::Event::Delete(node) => self.deleted(node),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

pub async fn launch_node_observer(client: kube::Client, expectations: Arc<Expectations>) {
    let mut observer = NodeEventObserver::new(expectations);
    let mut events = watcher(Api::<EtcdNode>::all(client), watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => observer.observe(&event),
            Err(e) => warn!("EtcdNode watch failed: {e}"),
        }
    }
}

pub async fn launch_nodeset_controller(ctx: Arc<ContextData<KubeStore>>) {
    let client = ctx.store.client().clone();
    info!("Launching EtcdNodeSet controller");
    Controller::new(Api::<EtcdNodeSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<EtcdNode>::all(client), watcher::Config::default())
        .run(reconcile, controller_error_policy, ctx)
        .for_each(controller_info)
        .await;
}
