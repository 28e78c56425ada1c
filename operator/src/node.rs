// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Drives one etcd member: its peer Service, boot payload, virtual machine,
//! bootstrap over SSH and health.

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use kube::runtime::{
    controller::{Action, Controller},
    watcher,
};
use kube::{Api, Resource};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crds::conditions::{
    MEMBER_FINALIZED_CONDITION, PROVISIONED_CONDITION, READY_CONDITION, is_condition_true, now,
    set_condition,
};
use crds::{
    CloudInitNoCloudSource, CpuSpec, DataVolumeSource, DataVolumeSourceSpec, DataVolumeSpec,
    DataVolumeTemplateSpec, Devices, Disk, DiskTarget, DomainSpec, EtcdNode, EtcdNodeStatus,
    LABEL_CLUSTER, LABEL_KUBEVIRT_DOMAIN, LABEL_NODE, MemorySpec, NODE_FINALIZER, NodePhase, ObjectLabels,
    PvcSource, StorageResources, StorageSpec, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceSpec, VirtualMachineInstanceTemplateSpec, VirtualMachineSpec, Volume,
    peer_service_name, userdata_secret_name,
};

use crate::finalizer::{Step, delete_and_wait, ensure_finalizer, remove_finalizer};
use crate::probe::ProbeTls;
use crate::secrets::{
    PASSWORD_KEY, SSH_PRIVATE_KEY, SSH_PUBLIC_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY, read_secret,
    secret,
};
use crate::ssh::{SshError, SshTarget};
use crate::store::{KubeStore, ObjectStore, create_if_absent, get_opt, owner_reference};
use crate::userdata::{BootParameters, USERDATA_KEY, render_userdata};
use crate::{
    ContextData, ControllerError, HasStatus, WAIT_BACKOFF, check_reference,
    controller_error_policy, controller_info, finish_reconcile, name_or_default,
    namespace_or_default, persist_status,
};

pub const SSH_PORT: i32 = 22;
pub const CLIENT_PORT: i32 = 2379;
pub const PEER_PORT: i32 = 2380;
const SSH_PORT_NAME: &str = "ssh";
const ROOT_DISK: &str = "rootdisk";
const CLOUD_INIT_DISK: &str = "cloudinitdisk";
const DISK_BUS: &str = "virtio";

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn node_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_NODE.to_string(), name.to_string())])
}

fn peer_service(node: &EtcdNode, namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(peer_service_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(node_labels(name)),
            owner_references: owner_reference(node).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                LABEL_KUBEVIRT_DOMAIN.to_string(),
                name.to_string(),
            )])),
            ports: Some(vec![
                service_port(SSH_PORT_NAME, SSH_PORT),
                service_port("client", CLIENT_PORT),
                service_port("peer", PEER_PORT),
            ]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
}

fn ssh_port(service: &Service) -> Option<u16> {
    service
        .spec
        .as_ref()?
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref() == Some(SSH_PORT_NAME))
        .and_then(|p| u16::try_from(p.port).ok())
}

fn root_disk_name(name: &str) -> String {
    format!("{name}-{ROOT_DISK}")
}

fn virtual_machine_spec<S: ObjectStore>(
    ctx: &ContextData<S>,
    node: &EtcdNode,
    namespace: &str,
    name: &str,
) -> VirtualMachineSpec {
    let disk = |disk_name: &str| Disk {
        name: disk_name.to_string(),
        disk: Some(DiskTarget {
            bus: DISK_BUS.to_string(),
        }),
    };
    let mut labels = node_labels(name);
    labels.insert(LABEL_KUBEVIRT_DOMAIN.to_string(), name.to_string());
    if let Some(cluster) = node.meta().labels.as_ref().and_then(|l| l.get(LABEL_CLUSTER)) {
        labels.insert(LABEL_CLUSTER.to_string(), cluster.clone());
    }

    VirtualMachineSpec {
        running: Some(true),
        template: VirtualMachineInstanceTemplateSpec {
            metadata: ObjectLabels { name: None, labels },
            spec: VirtualMachineInstanceSpec {
                hostname: Some(name.to_string()),
                domain: DomainSpec {
                    cpu: Some(CpuSpec {
                        cores: ctx.config.vm_cores,
                    }),
                    memory: Some(MemorySpec {
                        guest: ctx.config.vm_memory.clone(),
                    }),
                    devices: Devices {
                        disks: vec![disk(ROOT_DISK), disk(CLOUD_INIT_DISK)],
                    },
                },
                volumes: vec![
                    Volume {
                        name: ROOT_DISK.to_string(),
                        data_volume: Some(DataVolumeSource {
                            name: root_disk_name(name),
                        }),
                        cloud_init_no_cloud: None,
                    },
                    Volume {
                        name: CLOUD_INIT_DISK.to_string(),
                        data_volume: None,
                        cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                            secret_ref: Some(LocalObjectReference {
                                name: userdata_secret_name(name),
                            }),
                        }),
                    },
                ],
            },
        },
        data_volume_templates: vec![DataVolumeTemplateSpec {
            metadata: ObjectLabels {
                name: Some(root_disk_name(name)),
                labels: BTreeMap::new(),
            },
            spec: DataVolumeSpec {
                source: DataVolumeSourceSpec {
                    pvc: Some(PvcSource {
                        namespace: namespace.to_string(),
                        name: node.spec.boot_image_claim.clone(),
                    }),
                },
                storage: StorageSpec {
                    resources: StorageResources {
                        requests: BTreeMap::from([(
                            "storage".to_string(),
                            ctx.config.root_disk_size.clone(),
                        )]),
                    },
                },
            },
        }],
    }
}

async fn ensure_userdata<S: ObjectStore>(
    ctx: &ContextData<S>,
    node: &EtcdNode,
    namespace: &str,
    name: &str,
    peer_ip: &str,
) -> Result<(), ControllerError> {
    let secret_name = userdata_secret_name(name);
    if get_opt::<S, Secret>(&ctx.store, namespace, &secret_name)
        .await?
        .is_some()
    {
        return Ok(());
    }

    let spec = &node.spec;
    let ca = read_secret(&ctx.store, namespace, &spec.ca_secret, &[TLS_CERT_KEY, TLS_PRIVATE_KEY]).await?;
    let ssh = read_secret(&ctx.store, namespace, &spec.ssh_key_secret, &[SSH_PUBLIC_KEY]).await?;
    let login_password = match &spec.login_secret {
        Some(login) => read_secret(&ctx.store, namespace, login, &[PASSWORD_KEY])
            .await?
            .pop(),
        None => None,
    };

    let params = BootParameters {
        node_name: name,
        namespace,
        peer_ip,
        cluster_endpoint: &spec.cluster_endpoint,
        etcd_version: &spec.version,
        authorized_key: &ssh[0],
        ca_cert_pem: &ca[0],
        ca_key_pem: &ca[1],
        login_password: login_password.as_deref(),
    };
    let userdata = render_userdata(&ctx.config, &params)?;
    let payload = secret(
        &secret_name,
        namespace,
        "Opaque",
        BTreeMap::from([(USERDATA_KEY, userdata)]),
        node_labels(name),
        owner_reference(node),
    );
    create_if_absent(&ctx.store, namespace, &payload).await?;
    Ok(())
}

async fn ensure_virtual_machine<S: ObjectStore>(
    ctx: &ContextData<S>,
    node: &EtcdNode,
    namespace: &str,
    name: &str,
) -> Result<(), ControllerError> {
    let desired = virtual_machine_spec(ctx, node, namespace, name);
    match get_opt::<S, VirtualMachine>(&ctx.store, namespace, name).await? {
        None => {
            let mut vm = VirtualMachine::new(name, desired);
            vm.metadata.namespace = Some(namespace.to_string());
            vm.metadata.labels = Some(node_labels(name));
            vm.metadata.owner_references = owner_reference(node).map(|o| vec![o]);
            create_if_absent(&ctx.store, namespace, &vm).await?;
        }
        Some(existing) if existing.spec != desired => {
            let mut vm = existing;
            vm.spec = desired;
            ctx.store.replace(namespace, &vm).await?;
            info!("Replace VirtualMachine {namespace}/{name}");
        }
        Some(_) => {}
    }
    Ok(())
}

async fn provision<S: ObjectStore>(
    ctx: &ContextData<S>,
    node: &EtcdNode,
    status: &mut EtcdNodeStatus,
    service: &Service,
    peer_ip: &str,
) -> Result<(), ControllerError> {
    let namespace = namespace_or_default(node.meta());
    let port = ssh_port(service).ok_or_else(|| {
        ControllerError::waiting(format!("ssh port on service {}", peer_service_name(&name_or_default(node.meta()))))
    })?;
    let key = read_secret(&ctx.store, &namespace, &node.spec.ssh_key_secret, &[SSH_PRIVATE_KEY])
        .await?
        .remove(0);
    let target = SshTarget {
        host: peer_ip.to_string(),
        port,
        user: ctx.config.ssh_user.clone(),
        private_key_pem: key,
    };

    let session = match ctx.shell.dial(&target).await {
        Ok(session) => session,
        Err(e) if e.is_dial() => {
            return Err(ControllerError::Waiting {
                what: format!("ssh on {target}: {e}"),
                delay: Some(WAIT_BACKOFF),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let mode = if node.spec.is_first_node { "--new" } else { "--join" };
    match session.run(&format!("sudo etcd-bootstrap start {mode}")).await {
        Ok(_) => {
            info!("Provisioned etcd member {namespace}/{}", name_or_default(node.meta()));
            set_condition(&mut status.conditions, PROVISIONED_CONDITION, true, "", false, now());
            Ok(())
        }
        Err(SshError::Command {
            command,
            status: code,
            stderr,
        }) => {
            set_condition(&mut status.conditions, PROVISIONED_CONDITION, false, &stderr, false, now());
            Err(SshError::Command {
                command,
                status: code,
                stderr,
            }
            .into())
        }
        Err(e) if e.is_dial() => Err(ControllerError::Waiting {
            what: format!("ssh on {target}: {e}"),
            delay: Some(WAIT_BACKOFF),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn probe_health<S: ObjectStore>(
    ctx: &ContextData<S>,
    node: &EtcdNode,
    peer_ip: &str,
) -> Result<bool, ControllerError> {
    let namespace = namespace_or_default(node.meta());
    let ca = read_secret(&ctx.store, &namespace, &node.spec.ca_secret, &[TLS_CERT_KEY]).await?;
    let mut client = read_secret(
        &ctx.store,
        &namespace,
        &node.spec.client_secret,
        &[TLS_CERT_KEY, TLS_PRIVATE_KEY],
    )
    .await?;
    let tls = ProbeTls {
        ca_cert_pem: ca[0].clone(),
        client_key_pem: client.remove(1),
        client_cert_pem: client.remove(0),
    };
    let url = format!("https://{peer_ip}:{CLIENT_PORT}/health");
    Ok(ctx.prober.probe(&url, &tls).await?)
}

async fn reconcile_active<S: ObjectStore>(
    node: &EtcdNode,
    ctx: &ContextData<S>,
    status: &mut EtcdNodeStatus,
) -> Result<Action, ControllerError> {
    let namespace = namespace_or_default(node.meta());
    let name = name_or_default(node.meta());
    let service_name = peer_service_name(&name);
    let userdata_name = userdata_secret_name(&name);
    check_reference("peerEndpoint", &status.peer_endpoint, &service_name)?;
    check_reference("userdata", &status.userdata, &userdata_name)?;
    check_reference("instance", &status.instance, &name)?;

    let service = create_if_absent(&ctx.store, &namespace, &peer_service(node, &namespace, &name)).await?;
    status.peer_endpoint = Some(service_name.clone());
    let peer_ip = cluster_ip(&service)
        .ok_or_else(|| ControllerError::waiting(format!("cluster IP of service {namespace}/{service_name}")))?;

    ensure_userdata(ctx, node, &namespace, &name, &peer_ip).await?;
    status.userdata = Some(userdata_name);

    ensure_virtual_machine(ctx, node, &namespace, &name).await?;
    status.instance = Some(name.clone());
    if let Some(vmi) = get_opt::<S, VirtualMachineInstance>(&ctx.store, &namespace, &name).await? {
        status.host = vmi.status.and_then(|s| s.node_name);
    }

    if !is_condition_true(&status.conditions, PROVISIONED_CONDITION) {
        provision(ctx, node, status, &service, &peer_ip).await?;
    }

    let healthy = probe_health(ctx, node, &peer_ip).await?;
    let message = if healthy { "" } else { "health endpoint not ready" };
    set_condition(&mut status.conditions, READY_CONDITION, healthy, message, true, now());
    Ok(Action::requeue(ctx.config.resync_interval()))
}

/// Tells the member to leave the cluster before its instance goes away.
/// Best effort: an unreachable instance cannot be told anything.
async fn leave_cluster<S: ObjectStore>(ctx: &ContextData<S>, node: &EtcdNode) {
    let namespace = namespace_or_default(node.meta());
    let name = name_or_default(node.meta());
    let service = match get_opt::<S, Service>(&ctx.store, &namespace, &peer_service_name(&name)).await {
        Ok(Some(service)) => service,
        _ => return,
    };
    let (Some(host), Some(port)) = (cluster_ip(&service), ssh_port(&service)) else {
        return;
    };
    let Ok(mut key) = read_secret(&ctx.store, &namespace, &node.spec.ssh_key_secret, &[SSH_PRIVATE_KEY]).await else {
        return;
    };
    let target = SshTarget {
        host,
        port,
        user: ctx.config.ssh_user.clone(),
        private_key_pem: key.remove(0),
    };
    let result = match ctx.shell.dial(&target).await {
        Ok(session) => session.run("sudo etcd-bootstrap leave").await.map(|_| ()),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => info!("etcd member {namespace}/{name} left the cluster"),
        Err(e) => warn!("etcd member {namespace}/{name} could not leave the cluster: {e}"),
    }
}

async fn finalize<S: ObjectStore>(
    node: &EtcdNode,
    ctx: &ContextData<S>,
    mut status: EtcdNodeStatus,
) -> Result<Action, ControllerError> {
    let namespace = namespace_or_default(node.meta());
    let name = name_or_default(node.meta());
    status.phase = NodePhase::Deleting;

    if !is_condition_true(&status.conditions, MEMBER_FINALIZED_CONDITION) {
        let vm_present = get_opt::<S, VirtualMachine>(&ctx.store, &namespace, &name)
            .await?
            .is_some_and(|vm| vm.meta().deletion_timestamp.is_none());
        if vm_present && is_condition_true(&status.conditions, PROVISIONED_CONDITION) {
            leave_cluster(ctx, node).await;
        }
        let gone = delete_and_wait::<S, VirtualMachine>(&ctx.store, &namespace, &name).await;
        if let Err(e) = gone {
            return finish_reconcile(&ctx.store, node, &status, Err(e)).await;
        }
        set_condition(
            &mut status.conditions,
            MEMBER_FINALIZED_CONDITION,
            true,
            "virtual machine deleted",
            false,
            now(),
        );
    }

    let node = persist_status(&ctx.store, node, &status)
        .await?
        .unwrap_or_else(|| node.clone());
    remove_finalizer(&ctx.store, &node, NODE_FINALIZER).await
}

fn node_phase(status: &EtcdNodeStatus, result: &Result<Action, ControllerError>) -> NodePhase {
    match result {
        Err(e) if e.is_fatal() => NodePhase::Error,
        _ if is_condition_true(&status.conditions, READY_CONDITION) => NodePhase::Running,
        _ if is_condition_true(&status.conditions, PROVISIONED_CONDITION) => NodePhase::Provisioned,
        _ => NodePhase::Creating,
    }
}

pub async fn reconcile<S: ObjectStore>(
    node: Arc<EtcdNode>,
    ctx: Arc<ContextData<S>>,
) -> Result<Action, ControllerError> {
    let mut status = node.status_or_default();
    match ensure_finalizer(&ctx.store, node.as_ref(), NODE_FINALIZER).await? {
        Step::Done(action) => Ok(action),
        Step::Finalize => finalize(&node, &ctx, status).await,
        Step::Reconcile => {
            let result = reconcile_active(&node, &ctx, &mut status).await;
            status.phase = node_phase(&status, &result);
            finish_reconcile(&ctx.store, node.as_ref(), &status, result).await
        }
    }
}

pub async fn launch_node_controller(ctx: Arc<ContextData<KubeStore>>) {
    let client = ctx.store.client().clone();
    info!("Launching EtcdNode controller");
    Controller::new(Api::<EtcdNode>::all(client.clone()), watcher::Config::default())
        .owns(Api::<VirtualMachine>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client), watcher::Config::default())
        .run(reconcile, controller_error_policy, ctx)
        .for_each(controller_info)
        .await;
}
