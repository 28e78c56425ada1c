// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Rolls node templates out through Node-Sets: one set per template,
//! revision history, proportional scaling and surge/unavailability bounds.

use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::{
    controller::{Action, Controller},
    watcher,
};
use kube::{Api, Resource};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crds::{EtcdNodeDeployment, EtcdNodeDeploymentStatus, EtcdNodeSet, EtcdNodeSetStatus};

use crate::store::{KubeStore, ObjectStore, list_controlled, object_key};
use crate::{
    ContextData, ControllerError, controller_error_policy, controller_info, finish_reconcile,
    namespace_or_default,
};

mod rolling;
mod sync;
pub mod util;

use sync::NewSet;
use util::{by_creation, desired_replicas_annotation, equal_ignore_hash, is_active, resolve_fenceposts, revision};

const COLLISION_REQUEUE: Duration = Duration::from_secs(1);

/// The sets of one deployment, split into the one running the current
/// template and the rest. Updated in place as the pass writes them.
#[derive(Debug, Clone, Default)]
pub struct SetState {
    pub new: Option<EtcdNodeSet>,
    pub old: Vec<EtcdNodeSet>,
    pub collision_count: Option<i32>,
}

impl SetState {
    /// The oldest set whose template matches is the new one.
    pub fn split(deployment: &EtcdNodeDeployment, mut sets: Vec<EtcdNodeSet>) -> Self {
        sets.sort_by(by_creation);
        let new_name = sets
            .iter()
            .find(|s| equal_ignore_hash(&deployment.spec.template, &s.spec.template))
            .and_then(|s| s.meta().name.clone());
        let (new, old): (Vec<_>, Vec<_>) = sets
            .into_iter()
            .partition(|s| new_name.is_some() && s.meta().name == new_name);
        Self {
            new: new.into_iter().next(),
            old,
            collision_count: deployment.status.as_ref().and_then(|s| s.collision_count),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &EtcdNodeSet> {
        self.new.iter().chain(self.old.iter())
    }

    pub fn update(&mut self, set: EtcdNodeSet) {
        let name = set.meta().name.clone();
        match &mut self.new {
            Some(new) if new.meta().name == name => *new = set,
            _ => {
                if let Some(old) = self.old.iter_mut().find(|s| s.meta().name == name) {
                    *old = set;
                }
            }
        }
    }

    pub fn status(&self, deployment: &EtcdNodeDeployment) -> EtcdNodeDeploymentStatus {
        fn observed(set: &EtcdNodeSet, field: fn(&EtcdNodeSetStatus) -> i32) -> i32 {
            set.status.as_ref().map_or(0, field)
        }
        let available: i32 = self.all().map(|s| observed(s, |st| st.available_replicas)).sum();
        let desired: i32 = self.all().map(|s| s.spec.replicas()).sum();
        EtcdNodeDeploymentStatus {
            replicas: self.all().map(|s| observed(s, |st| st.active_replicas)).sum(),
            updated_replicas: self.new.as_ref().map_or(0, |s| observed(s, |st| st.active_replicas)),
            ready_replicas: self.all().map(|s| observed(s, |st| st.ready_replicas)).sum(),
            available_replicas: available,
            unavailable_replicas: (desired - available).max(0),
            observed_generation: deployment.meta().generation.unwrap_or_default(),
            collision_count: self.collision_count,
            revision: self
                .new
                .as_ref()
                .map(revision)
                .or_else(|| deployment.status.as_ref().and_then(|s| s.revision)),
        }
    }
}

fn selects_everything(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|l| l.is_empty())
        && selector.match_expressions.as_ref().is_none_or(|e| e.is_empty())
}

/// An active set was sized for a different replica count than requested.
fn is_scaling_event(deployment: &EtcdNodeDeployment, state: &SetState) -> bool {
    let replicas = deployment.spec.replicas();
    state
        .all()
        .filter(|s| is_active(s))
        .filter_map(desired_replicas_annotation)
        .any(|desired| desired != replicas)
}

async fn sync<S: ObjectStore>(
    ctx: &ContextData<S>,
    deployment: &EtcdNodeDeployment,
    state: &mut SetState,
) -> Result<Action, ControllerError> {
    let key = object_key(deployment);
    if deployment.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    if selects_everything(&deployment.spec.selector) {
        warn!("EtcdNodeDeployment {key} has an empty selector, not selecting any node set");
        return Ok(Action::await_change());
    }
    let fenceposts = resolve_fenceposts(&deployment.spec)?;

    sync::sync_new_set(ctx, deployment, fenceposts, state, false).await?;
    if is_scaling_event(deployment, state) {
        debug!("Scaling EtcdNodeDeployment {key} to {}", deployment.spec.replicas());
        sync::scale(ctx, deployment, fenceposts, state).await?;
        return Ok(Action::await_change());
    }
    match sync::sync_new_set(ctx, deployment, fenceposts, state, true).await? {
        NewSet::Collided => Ok(Action::requeue(COLLISION_REQUEUE)),
        NewSet::Synced => rolling::rollout(ctx, deployment, fenceposts, state).await,
    }
}

pub async fn reconcile<S: ObjectStore>(
    deployment: Arc<EtcdNodeDeployment>,
    ctx: Arc<ContextData<S>>,
) -> Result<Action, ControllerError> {
    let namespace = namespace_or_default(deployment.meta());
    let sets = match deployment.meta().uid.as_deref() {
        Some(uid) => {
            list_controlled::<S, EtcdNodeSet>(&ctx.store, &namespace, &deployment.spec.selector, uid)
                .await?
        }
        None => vec![],
    };
    let mut state = SetState::split(&deployment, sets);
    let result = sync(&ctx, &deployment, &mut state).await;
    let status = state.status(&deployment);
    finish_reconcile(&ctx.store, deployment.as_ref(), &status, result).await
}

pub async fn launch_deployment_controller(ctx: Arc<ContextData<KubeStore>>) {
    let client = ctx.store.client().clone();
    info!("Launching EtcdNodeDeployment controller");
    Controller::new(Api::<EtcdNodeDeployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<EtcdNodeSet>::all(client), watcher::Config::default())
        .run(reconcile, controller_error_policy, ctx)
        .for_each(controller_info)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_store::{MemoryStore, TestContext, test_context};
    use crate::store::owner_reference;
    use crds::{
        ANNOTATION_DESIRED_REPLICAS, ANNOTATION_MAX_REPLICAS, ANNOTATION_REVISION,
        EtcdNodeDeploymentSpec, EtcdNodeSetSpec, EtcdNodeSpec, EtcdNodeTemplate,
        LABEL_CLUSTER, LABEL_TEMPLATE_HASH, NodeDeploymentStrategy, RollingUpdate,
        TemplateMetadata,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use serde_json::json;
    use std::collections::BTreeMap;
    use util::template_hash;

    const NS: &str = "db";

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_CLUSTER.to_string(), "demo".to_string())])
    }

    fn template(version: &str) -> EtcdNodeTemplate {
        EtcdNodeTemplate {
            metadata: TemplateMetadata {
                labels: labels(),
                ..Default::default()
            },
            spec: EtcdNodeSpec {
                version: version.to_string(),
                ..Default::default()
            },
        }
    }

    async fn create_deployment(
        store: &MemoryStore,
        replicas: i32,
        surge: i32,
        unavailable: i32,
        history: Option<i32>,
    ) -> EtcdNodeDeployment {
        let mut d = EtcdNodeDeployment::new(
            "demo",
            EtcdNodeDeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels()),
                    ..Default::default()
                },
                template: template("v3.5.21"),
                strategy: NodeDeploymentStrategy {
                    rolling_update: Some(RollingUpdate {
                        max_surge: Some(IntOrString::Int(surge)),
                        max_unavailable: Some(IntOrString::Int(unavailable)),
                    }),
                },
                revision_history_limit: history,
            },
        );
        d.metadata.namespace = Some(NS.to_string());
        store.create(NS, &d).await.unwrap()
    }

    async fn create_owned_set(
        store: &MemoryStore,
        d: &EtcdNodeDeployment,
        name: &str,
        version: &str,
        replicas: i32,
        annotations: &[(&str, &str)],
    ) -> EtcdNodeSet {
        let mut set = EtcdNodeSet::new(
            name,
            EtcdNodeSetSpec {
                replicas: Some(replicas),
                selector: d.spec.selector.clone(),
                template: template(version),
            },
        );
        set.metadata.namespace = Some(NS.to_string());
        set.metadata.labels = Some(labels());
        set.metadata.owner_references = owner_reference(d).map(|o| vec![o]);
        set.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        store.create(NS, &set).await.unwrap()
    }

    /// Reports `ready` available nodes out of `active`, as the set controller would.
    async fn report(store: &MemoryStore, name: &str, active: i32, ready: i32) {
        let set: EtcdNodeSet = store.get(NS, name).await.unwrap();
        let status = EtcdNodeSetStatus {
            replicas: active,
            active_replicas: active,
            ready_replicas: ready,
            available_replicas: ready,
            observed_generation: set.metadata.generation.unwrap(),
        };
        store.set_status::<EtcdNodeSet>(NS, name, &status);
    }

    async fn pass(t: &TestContext) -> Result<Action, ControllerError> {
        let d: EtcdNodeDeployment = t.store.get(NS, "demo").await.unwrap();
        reconcile(Arc::new(d), t.ctx.clone()).await
    }

    async fn replicas_of(store: &MemoryStore, name: &str) -> i32 {
        store.get::<EtcdNodeSet>(NS, name).await.unwrap().spec.replicas.unwrap()
    }

    fn stored_status(store: &MemoryStore) -> EtcdNodeDeploymentStatus {
        store.all::<EtcdNodeDeployment>(NS)[0].status.clone().unwrap()
    }

    fn annotation(set: &EtcdNodeSet, key: &str) -> String {
        set.metadata.annotations.as_ref().unwrap()[key].clone()
    }

    #[tokio::test]
    async fn test_first_rollout_creates_one_set() {
        let t = test_context();
        let d = create_deployment(&t.store, 3, 1, 0, None).await;
        assert_eq!(pass(&t).await.unwrap(), Action::await_change());

        let sets = t.store.all::<EtcdNodeSet>(NS);
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        let hash = template_hash(&d.spec.template, None).unwrap();
        assert_eq!(set.metadata.name.as_deref(), Some(format!("demo-{hash}").as_str()));
        assert_eq!(set.spec.replicas, Some(3));
        assert_eq!(set.spec.template.metadata.labels[LABEL_TEMPLATE_HASH], hash);
        assert_eq!(set.spec.selector.match_labels.as_ref().unwrap()[LABEL_TEMPLATE_HASH], hash);
        assert_eq!(annotation(set, ANNOTATION_REVISION), "1");
        assert_eq!(annotation(set, ANNOTATION_DESIRED_REPLICAS), "3");
        assert_eq!(annotation(set, ANNOTATION_MAX_REPLICAS), "4");

        let status = stored_status(&t.store);
        assert_eq!(status.collision_count, None);
        assert_eq!(status.revision, Some(1));
        assert_eq!(status.observed_generation, 1);
        assert_eq!(status.unavailable_replicas, 3);
    }

    #[tokio::test]
    async fn test_converged_deployment_is_left_alone() {
        let t = test_context();
        create_deployment(&t.store, 3, 1, 0, None).await;
        pass(&t).await.unwrap();
        let name = t.store.all::<EtcdNodeSet>(NS)[0].metadata.name.clone().unwrap();
        report(&t.store, &name, 3, 3).await;

        pass(&t).await.unwrap();
        let status = stored_status(&t.store);
        assert_eq!((status.updated_replicas, status.available_replicas), (3, 3));
        assert_eq!(status.unavailable_replicas, 0);

        let before = t.store.mutations();
        pass(&t).await.unwrap();
        assert_eq!(t.store.mutations(), before);
    }

    #[tokio::test]
    async fn test_rolling_update_respects_surge_and_availability() {
        let t = test_context();
        create_deployment(&t.store, 3, 1, 0, None).await;
        pass(&t).await.unwrap();
        let first = t.store.all::<EtcdNodeSet>(NS)[0].metadata.name.clone().unwrap();
        report(&t.store, &first, 3, 3).await;

        let patch = json!({"spec": {"template": {"spec": {"version": "v3.6.0"}}}});
        let d: EtcdNodeDeployment = t.store.patch(NS, "demo", &patch).await.unwrap();
        pass(&t).await.unwrap();

        let second = format!("demo-{}", template_hash(&d.spec.template, None).unwrap());
        let set: EtcdNodeSet = t.store.get(NS, &second).await.unwrap();
        assert_eq!(set.spec.replicas, Some(1));
        assert_eq!(annotation(&set, ANNOTATION_REVISION), "2");
        assert_eq!(replicas_of(&t.store, &first).await, 3);

        // Nothing moves until the surge node is available.
        pass(&t).await.unwrap();
        assert_eq!(replicas_of(&t.store, &first).await, 3);
        assert_eq!(replicas_of(&t.store, &second).await, 1);

        report(&t.store, &second, 1, 1).await;
        pass(&t).await.unwrap();
        assert_eq!(replicas_of(&t.store, &first).await, 2);
        assert_eq!(replicas_of(&t.store, &second).await, 1);

        report(&t.store, &first, 2, 2).await;
        pass(&t).await.unwrap();
        assert_eq!(replicas_of(&t.store, &second).await, 2);
    }

    #[tokio::test]
    async fn test_hash_collision_bumps_collision_count() {
        let t = test_context();
        let d = create_deployment(&t.store, 3, 1, 0, None).await;
        let taken = format!("demo-{}", template_hash(&d.spec.template, None).unwrap());
        let mut foreign = EtcdNodeSet::new(
            &taken,
            EtcdNodeSetSpec {
                replicas: Some(0),
                selector: d.spec.selector.clone(),
                template: template("v3.4.0"),
            },
        );
        foreign.metadata.namespace = Some(NS.to_string());
        t.store.create(NS, &foreign).await.unwrap();

        assert_eq!(pass(&t).await.unwrap(), Action::requeue(COLLISION_REQUEUE));
        assert_eq!(stored_status(&t.store).collision_count, Some(1));
        assert_eq!(t.store.all::<EtcdNodeSet>(NS).len(), 1);

        pass(&t).await.unwrap();
        let salted = format!("demo-{}", template_hash(&d.spec.template, Some(1)).unwrap());
        assert_ne!(salted, taken);
        assert_eq!(replicas_of(&t.store, &salted).await, 3);
        assert_eq!(stored_status(&t.store).collision_count, Some(1));
        assert_eq!(replicas_of(&t.store, &taken).await, 0);
    }

    #[tokio::test]
    async fn test_scaling_mid_rollout_is_proportional() {
        let t = test_context();
        let d = create_deployment(&t.store, 15, 3, 0, None).await;
        let sized_for_ten = [(ANNOTATION_DESIRED_REPLICAS, "10"), (ANNOTATION_MAX_REPLICAS, "13")];
        let old_annotations = [sized_for_ten[0], sized_for_ten[1], (ANNOTATION_REVISION, "1")];
        let new_annotations = [sized_for_ten[0], sized_for_ten[1], (ANNOTATION_REVISION, "2")];
        create_owned_set(&t.store, &d, "demo-old", "v3.4.0", 8, &old_annotations).await;
        create_owned_set(&t.store, &d, "demo-new", "v3.5.21", 5, &new_annotations).await;

        pass(&t).await.unwrap();
        assert_eq!(replicas_of(&t.store, "demo-old").await, 11);
        assert_eq!(replicas_of(&t.store, "demo-new").await, 7);
        for name in ["demo-old", "demo-new"] {
            let set: EtcdNodeSet = t.store.get(NS, name).await.unwrap();
            assert_eq!(annotation(&set, ANNOTATION_DESIRED_REPLICAS), "15");
            assert_eq!(annotation(&set, ANNOTATION_MAX_REPLICAS), "18");
        }
        assert_eq!(t.store.all::<EtcdNodeSet>(NS).len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_trimmed_once_sets_are_drained() {
        let t = test_context();
        let d = create_deployment(&t.store, 2, 1, 0, Some(1)).await;
        let current = [(ANNOTATION_DESIRED_REPLICAS, "2"), (ANNOTATION_MAX_REPLICAS, "3"), (ANNOTATION_REVISION, "3")];
        create_owned_set(&t.store, &d, "demo-r1", "v3.4.0", 0, &[(ANNOTATION_REVISION, "1")]).await;
        create_owned_set(&t.store, &d, "demo-r2", "v3.5.0", 0, &[(ANNOTATION_REVISION, "2")]).await;
        create_owned_set(&t.store, &d, "demo-r3", "v3.5.21", 2, &current).await;
        report(&t.store, "demo-r3", 2, 2).await;
        report(&t.store, "demo-r2", 0, 0).await;
        // One node of the oldest set is still terminating.
        let draining = EtcdNodeSetStatus {
            replicas: 1,
            observed_generation: 1,
            ..Default::default()
        };
        t.store.set_status::<EtcdNodeSet>(NS, "demo-r1", &draining);

        pass(&t).await.unwrap();
        assert_eq!(t.store.all::<EtcdNodeSet>(NS).len(), 3);

        report(&t.store, "demo-r1", 0, 0).await;
        pass(&t).await.unwrap();
        let names: Vec<_> = t
            .store
            .all::<EtcdNodeSet>(NS)
            .into_iter()
            .map(|s| s.metadata.name.unwrap())
            .collect();
        assert_eq!(names, vec!["demo-r2", "demo-r3"]);
        assert_eq!(stored_status(&t.store).revision, Some(3));
    }

    #[test]
    fn test_split_picks_oldest_matching_set() {
        let mut d = EtcdNodeDeployment::new("demo", EtcdNodeDeploymentSpec {
            template: template("v3.5.21"),
            ..Default::default()
        });
        d.status = Some(EtcdNodeDeploymentStatus {
            collision_count: Some(2),
            ..Default::default()
        });
        let set = |name: &str, version: &str, secs: i64| {
            let mut s = EtcdNodeSet::new(name, EtcdNodeSetSpec {
                template: template(version),
                ..Default::default()
            });
            s.metadata.creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::DateTime::from_timestamp(secs, 0).unwrap(),
            ));
            s
        };
        let state = SetState::split(
            &d,
            vec![set("b", "v3.5.21", 20), set("a", "v3.4.0", 5), set("c", "v3.5.21", 10)],
        );
        assert_eq!(state.new.unwrap().metadata.name.as_deref(), Some("c"));
        let old: Vec<_> = state.old.iter().map(|s| s.metadata.name.clone().unwrap()).collect();
        assert_eq!(old, vec!["a", "b"]);
        assert_eq!(state.collision_count, Some(2));
    }
}
