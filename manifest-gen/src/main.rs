// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::Parser;
use crds::{
    EtcdCluster, EtcdClusterSpec, EtcdNode, EtcdNodeDeployment, EtcdNodeSet, VirtualMachine,
    VirtualMachineInstance,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, EnvVar, Namespace, PodSpec, PodTemplateSpec, Secret, Service,
            ServiceAccount,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{CustomResourceExt, Resource};
use log::info;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::PathBuf,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Output directory to save rendered YAML
    #[arg(long, default_value = "manifests")]
    output_dir: PathBuf,

    /// Container image to use in the deployment
    #[arg(long, default_value = "quay.io/etcd-operator/etcd-operator:latest")]
    image: String,

    /// Namespace where to install the operator
    #[arg(long, default_value = "etcd-operator")]
    namespace: String,

    /// Boot image claim referenced by the sample EtcdCluster
    #[arg(long, default_value = "fedora-cloud")]
    boot_image_claim: String,

    /// etcd release referenced by the sample EtcdCluster
    #[arg(long, default_value = "v3.5.21")]
    etcd_version: String,

    /// Log filter handed to the operator
    #[arg(long, default_value = "info")]
    log_level: String,
}

const OPERATOR_NAME: &str = "etcd-operator";
const ALL_VERBS: [&str; 7] = ["create", "get", "list", "watch", "patch", "update", "delete"];
const READ_VERBS: [&str; 3] = ["get", "list", "watch"];

fn rule(group: &str, resources: Vec<String>, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn operator_rules() -> Vec<PolicyRule> {
    let group = EtcdCluster::group(&()).to_string();
    let plurals = [
        EtcdCluster::plural(&()).to_string(),
        EtcdNodeDeployment::plural(&()).to_string(),
        EtcdNodeSet::plural(&()).to_string(),
        EtcdNode::plural(&()).to_string(),
    ];
    vec![
        rule(&group, plurals.to_vec(), &ALL_VERBS),
        rule(
            &group,
            plurals.iter().map(|p| format!("{p}/status")).collect(),
            &["get", "patch", "update"],
        ),
        rule(
            &VirtualMachine::group(&()),
            vec![VirtualMachine::plural(&()).to_string()],
            &ALL_VERBS,
        ),
        rule(
            &VirtualMachineInstance::group(&()),
            vec![VirtualMachineInstance::plural(&()).to_string()],
            &READ_VERBS,
        ),
        rule(
            "",
            vec![Secret::plural(&()).to_string(), Service::plural(&()).to_string()],
            &ALL_VERBS,
        ),
    ]
}

fn generate_operator(args: &Args) -> Result<()> {
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(args.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    let labels = BTreeMap::from([("app".to_string(), OPERATOR_NAME.to_string())]);

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            namespace: Some(args.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(OPERATOR_NAME.to_string()),
                    containers: vec![Container {
                        name: OPERATOR_NAME.to_string(),
                        image: Some(args.image.clone()),
                        command: Some(vec![format!("/usr/bin/{OPERATOR_NAME}")]),
                        env: Some(vec![EnvVar {
                            name: "RUST_LOG".to_string(),
                            value: Some(args.log_level.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            namespace: Some(args.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    // Controllers watch every namespace.
    let role_name = format!("{OPERATOR_NAME}-role");
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            ..Default::default()
        },
        rules: Some(operator_rules()),
        ..Default::default()
    };
    let role_binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{OPERATOR_NAME}-rolebinding")),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: OPERATOR_NAME.to_string(),
            namespace: Some(args.namespace.clone()),
            ..Default::default()
        }]),
    };

    let combined_yaml = [
        serde_yaml::to_string(&ns)?,
        serde_yaml::to_string(&deployment)?,
        serde_yaml::to_string(&service_account)?,
        serde_yaml::to_string(&role)?,
        serde_yaml::to_string(&role_binding)?,
    ]
    .join("\n---\n");

    fs::create_dir_all(&args.output_dir)?;
    let output_path = args.output_dir.join("operator.yaml");
    fs::write(&output_path, combined_yaml)?;

    info!(
        "Generated operator, namespace, and RBAC at '{}'",
        output_path.display()
    );
    Ok(())
}

pub fn generate_crds(args: &Args) -> Result<()> {
    let crds = [
        ("etcd_cluster_crd.yaml", EtcdCluster::crd()),
        ("etcd_node_deployment_crd.yaml", EtcdNodeDeployment::crd()),
        ("etcd_node_set_crd.yaml", EtcdNodeSet::crd()),
        ("etcd_node_crd.yaml", EtcdNode::crd()),
    ];
    for (file_name, crd) in crds {
        let output_path = args.output_dir.join(file_name);
        let yaml = serde_yaml::to_string(&crd)?;
        let mut file = File::create(&output_path)?;
        file.write_all(yaml.as_bytes())?;
        info!("Generated CRD at {}", output_path.display());
    }
    Ok(())
}

pub fn generate_etcd_cluster_cr(args: &Args) -> Result<()> {
    let sample = EtcdCluster {
        metadata: ObjectMeta {
            name: Some("etcd".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: EtcdClusterSpec {
            version: args.etcd_version.clone(),
            replicas: Some(3),
            boot_image_claim: args.boot_image_claim.clone(),
            login_secret: None,
        },
        status: None,
    };

    let output_path = args.output_dir.join("etcd_cluster_cr.yaml");
    let yaml = serde_yaml::to_string(&sample)?;
    let mut file = File::create(&output_path)?;
    file.write_all(yaml.as_bytes())?;

    info!("Generated EtcdCluster CR at {}", output_path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    generate_operator(&args)?;
    generate_crds(&args)?;
    generate_etcd_cluster_cr(&args)?;

    Ok(())
}
