// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Top of the hierarchy: key material, the client Service, the seed member
//! and the deployment running every other member.

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::runtime::{
    controller::{Action, Controller},
    watcher,
};
use kube::{Api, Resource};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use crds::conditions::{READY_CONDITION, is_condition_true, now, set_condition};
use crds::{
    CLUSTER_FINALIZER, ClusterPhase, EtcdCluster, EtcdClusterStatus, EtcdNode,
    EtcdNodeDeployment, EtcdNodeDeploymentSpec, EtcdNodeSpec, EtcdNodeTemplate, LABEL_CLUSTER,
    NodeDeploymentStrategy, RollingUpdate, TemplateMetadata, ca_secret_name, client_secret_name,
    peer_secret_name, ssh_secret_name,
};

use crate::finalizer::{Step, delete_and_wait, ensure_finalizer, remove_finalizer};
use crate::node::CLIENT_PORT;
use crate::pki::{self, CertificatePair};
use crate::secrets::{
    SSH_PRIVATE_KEY, SSH_PUBLIC_KEY, SSH_SECRET_TYPE, TLS_CERT_KEY, TLS_PRIVATE_KEY,
    TLS_SECRET_TYPE, read_secret, secret,
};
use crate::store::{KubeStore, ObjectStore, create_if_absent, get_opt, owner_reference};
use crate::{
    ContextData, ControllerError, HasStatus, check_reference, controller_error_policy,
    controller_info, finish_reconcile, name_or_default, namespace_or_default, persist_status,
};

/// Member deployment history kept for rollbacks.
pub const REVISION_HISTORY_LIMIT: i32 = 10;
const CLIENT_COMMON_NAME: &str = "root";
const PEER_COMMON_NAME: &str = "peer";

pub fn seed_node_name(cluster: &str) -> String {
    format!("{cluster}-seed")
}

fn cluster_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CLUSTER.to_string(), name.to_string())])
}

fn tls_data(pair: CertificatePair) -> BTreeMap<&'static str, String> {
    BTreeMap::from([(TLS_CERT_KEY, pair.cert_pem), (TLS_PRIVATE_KEY, pair.key_pem)])
}

/// Creates the named secret from `generate` unless it already exists. Key
/// material is only generated when needed.
async fn ensure_secret<S, F>(
    ctx: &ContextData<S>,
    cluster: &EtcdCluster,
    namespace: &str,
    name: &str,
    type_: &str,
    generate: F,
) -> Result<(), ControllerError>
where
    S: ObjectStore,
    F: FnOnce() -> anyhow::Result<BTreeMap<&'static str, String>>,
{
    if get_opt::<S, Secret>(&ctx.store, namespace, name).await?.is_some() {
        return Ok(());
    }
    let labels = cluster_labels(&name_or_default(cluster.meta()));
    let s = secret(name, namespace, type_, generate()?, labels, owner_reference(cluster));
    create_if_absent(&ctx.store, namespace, &s).await?;
    Ok(())
}

async fn ensure_secrets<S: ObjectStore>(
    ctx: &ContextData<S>,
    cluster: &EtcdCluster,
    status: &mut EtcdClusterStatus,
) -> Result<(), ControllerError> {
    let namespace = namespace_or_default(cluster.meta());
    let name = name_or_default(cluster.meta());
    let (ca_name, client_name) = (ca_secret_name(&name), client_secret_name(&name));
    let (peer_name, ssh_name) = (peer_secret_name(&name), ssh_secret_name(&name));
    check_reference("caSecret", &status.ca_secret, &ca_name)?;
    check_reference("clientSecret", &status.client_secret, &client_name)?;
    check_reference("peerSecret", &status.peer_secret, &peer_name)?;
    check_reference("sshKeySecret", &status.ssh_key_secret, &ssh_name)?;

    ensure_secret(ctx, cluster, &namespace, &ca_name, TLS_SECRET_TYPE, || {
        Ok(tls_data(pki::create_ca(&name)?))
    })
    .await?;
    status.ca_secret = Some(ca_name.clone());

    let ca = read_secret(&ctx.store, &namespace, &ca_name, &[TLS_CERT_KEY, TLS_PRIVATE_KEY]).await?;
    ensure_secret(ctx, cluster, &namespace, &client_name, TLS_SECRET_TYPE, || {
        let pair = pki::create_leaf_certificate(CLIENT_COMMON_NAME, &[], &ca[0], &ca[1])?;
        Ok(tls_data(pair))
    })
    .await?;
    status.client_secret = Some(client_name);

    let peer_names = [name.clone(), format!("{name}.{namespace}.svc")];
    ensure_secret(ctx, cluster, &namespace, &peer_name, TLS_SECRET_TYPE, || {
        let pair = pki::create_leaf_certificate(PEER_COMMON_NAME, &peer_names, &ca[0], &ca[1])?;
        Ok(tls_data(pair))
    })
    .await?;
    status.peer_secret = Some(peer_name);

    ensure_secret(ctx, cluster, &namespace, &ssh_name, SSH_SECRET_TYPE, || {
        let pair = pki::generate_ssh_key_pair(&format!("etcd-operator@{namespace}/{name}"))?;
        Ok(BTreeMap::from([
            (SSH_PRIVATE_KEY, pair.private_key_pem),
            (SSH_PUBLIC_KEY, pair.authorized_key),
        ]))
    })
    .await?;
    status.ssh_key_secret = Some(ssh_name);
    Ok(())
}

fn client_service(cluster: &EtcdCluster, namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(cluster_labels(name)),
            owner_references: owner_reference(cluster).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(cluster_labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: CLIENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_spec(cluster: &EtcdCluster, name: &str, is_first_node: bool) -> EtcdNodeSpec {
    EtcdNodeSpec {
        version: cluster.spec.version.clone(),
        ca_secret: ca_secret_name(name),
        client_secret: client_secret_name(name),
        ssh_key_secret: ssh_secret_name(name),
        cluster_endpoint: name.to_string(),
        is_first_node,
        boot_image_claim: cluster.spec.boot_image_claim.clone(),
        login_secret: cluster.spec.login_secret.clone(),
    }
}

fn seed_node(cluster: &EtcdCluster, namespace: &str, name: &str) -> EtcdNode {
    let mut node = EtcdNode::new(&seed_node_name(name), node_spec(cluster, name, true));
    node.metadata.namespace = Some(namespace.to_string());
    node.metadata.labels = Some(cluster_labels(name));
    node.metadata.owner_references = owner_reference(cluster).map(|o| vec![o]);
    node
}

/// Every member but the seed, rolled out one surge node at a time without
/// ever taking a member away first.
fn node_deployment_spec(cluster: &EtcdCluster, name: &str) -> EtcdNodeDeploymentSpec {
    EtcdNodeDeploymentSpec {
        replicas: Some((cluster.spec.replicas() - 1).max(0)),
        selector: LabelSelector {
            match_labels: Some(cluster_labels(name)),
            ..Default::default()
        },
        template: EtcdNodeTemplate {
            metadata: TemplateMetadata {
                labels: cluster_labels(name),
                ..Default::default()
            },
            spec: node_spec(cluster, name, false),
        },
        strategy: NodeDeploymentStrategy {
            rolling_update: Some(RollingUpdate {
                max_surge: Some(IntOrString::Int(1)),
                max_unavailable: Some(IntOrString::Int(0)),
            }),
        },
        revision_history_limit: Some(REVISION_HISTORY_LIMIT),
    }
}

async fn ensure_node_deployment<S: ObjectStore>(
    ctx: &ContextData<S>,
    cluster: &EtcdCluster,
    namespace: &str,
    name: &str,
) -> Result<EtcdNodeDeployment, ControllerError> {
    let desired = node_deployment_spec(cluster, name);
    match get_opt::<S, EtcdNodeDeployment>(&ctx.store, namespace, name).await? {
        None => {
            let mut deployment = EtcdNodeDeployment::new(name, desired);
            deployment.metadata.namespace = Some(namespace.to_string());
            deployment.metadata.labels = Some(cluster_labels(name));
            deployment.metadata.owner_references = owner_reference(cluster).map(|o| vec![o]);
            Ok(create_if_absent(&ctx.store, namespace, &deployment).await?)
        }
        Some(mut existing) if existing.spec != desired => {
            existing.spec = desired;
            let updated = ctx.store.replace(namespace, &existing).await?;
            info!("Replace EtcdNodeDeployment {namespace}/{name}");
            Ok(updated)
        }
        Some(existing) => Ok(existing),
    }
}

async fn reconcile_active<S: ObjectStore>(
    cluster: &EtcdCluster,
    ctx: &ContextData<S>,
    status: &mut EtcdClusterStatus,
) -> Result<Action, ControllerError> {
    let namespace = namespace_or_default(cluster.meta());
    let name = name_or_default(cluster.meta());
    let seed_name = seed_node_name(&name);
    check_reference("endpoint", &status.endpoint, &name)?;
    check_reference("seedNode", &status.seed_node, &seed_name)?;
    check_reference("nodeDeployment", &status.node_deployment, &name)?;

    ensure_secrets(ctx, cluster, status).await?;

    create_if_absent(&ctx.store, &namespace, &client_service(cluster, &namespace, &name)).await?;
    status.endpoint = Some(name.clone());

    let seed = create_if_absent(&ctx.store, &namespace, &seed_node(cluster, &namespace, &name)).await?;
    status.seed_node = Some(seed_name);

    let deployment = ensure_node_deployment(ctx, cluster, &namespace, &name).await?;
    status.node_deployment = Some(name);

    let seed_ready = seed
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, READY_CONDITION));
    let members_ready = deployment.status.as_ref().map_or(0, |s| s.ready_replicas);
    status.current_replicas = i32::from(seed_ready) + members_ready;
    Ok(Action::requeue(ctx.config.resync_interval()))
}

fn update_phase(cluster: &EtcdCluster, status: &mut EtcdClusterStatus) {
    let running = status.current_replicas == cluster.spec.replicas();
    status.phase = match running {
        true => ClusterPhase::Running,
        false => ClusterPhase::Creating,
    };
    let message = match running {
        true => String::new(),
        false => format!(
            "{} of {} members ready",
            status.current_replicas,
            cluster.spec.replicas()
        ),
    };
    set_condition(&mut status.conditions, READY_CONDITION, running, &message, false, now());
    status.observed_generation = cluster.meta().generation;
}

/// Deletes the key material and releases the cluster once all of it is
/// gone. Members and the Service are collected with the cluster.
async fn finalize<S: ObjectStore>(
    cluster: &EtcdCluster,
    ctx: &ContextData<S>,
    mut status: EtcdClusterStatus,
) -> Result<Action, ControllerError> {
    let namespace = namespace_or_default(cluster.meta());
    let name = name_or_default(cluster.meta());
    status.phase = ClusterPhase::Deleting;

    let mut pending = None;
    for secret_name in [
        ca_secret_name(&name),
        client_secret_name(&name),
        peer_secret_name(&name),
        ssh_secret_name(&name),
    ] {
        match delete_and_wait::<S, Secret>(&ctx.store, &namespace, &secret_name).await {
            Ok(()) => {}
            Err(e) if e.is_waiting() => {
                pending.get_or_insert(e);
            }
            Err(e) => return finish_reconcile(&ctx.store, cluster, &status, Err(e)).await,
        }
    }
    if let Some(waiting) = pending {
        return finish_reconcile(&ctx.store, cluster, &status, Err(waiting)).await;
    }

    let cluster = persist_status(&ctx.store, cluster, &status)
        .await?
        .unwrap_or_else(|| cluster.clone());
    info!("Released EtcdCluster {namespace}/{name}");
    remove_finalizer(&ctx.store, &cluster, CLUSTER_FINALIZER).await
}

pub async fn reconcile<S: ObjectStore>(
    cluster: Arc<EtcdCluster>,
    ctx: Arc<ContextData<S>>,
) -> Result<Action, ControllerError> {
    let mut status = cluster.status_or_default();
    match ensure_finalizer(&ctx.store, cluster.as_ref(), CLUSTER_FINALIZER).await? {
        Step::Done(action) => Ok(action),
        Step::Finalize => finalize(&cluster, &ctx, status).await,
        Step::Reconcile => {
            let result = reconcile_active(&cluster, &ctx, &mut status).await;
            update_phase(&cluster, &mut status);
            finish_reconcile(&ctx.store, cluster.as_ref(), &status, result).await
        }
    }
}

pub async fn launch_cluster_controller(ctx: Arc<ContextData<KubeStore>>) {
    let client = ctx.store.client().clone();
    info!("Launching EtcdCluster controller");
    Controller::new(Api::<EtcdCluster>::all(client.clone()), watcher::Config::default())
        .owns(Api::<EtcdNode>::all(client.clone()), watcher::Config::default())
        .owns(Api::<EtcdNodeDeployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client), watcher::Config::default())
        .run(reconcile, controller_error_policy, ctx)
        .for_each(controller_info)
        .await;
}
