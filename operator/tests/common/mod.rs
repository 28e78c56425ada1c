// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DeleteParams;
use kube::{Api, Client};
use log::info;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tokio::process::Command;

pub mod timer;
pub use timer::Poller;

static INIT: Once = Once::new();

const MANIFESTS_DIR: &str = "../manifests";

pub struct TestContext {
    client: Client,
    test_namespace: String,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });

        let client = Client::try_default().await?;
        let namespace = test_namespace_name();

        create_test_namespace(&client, &namespace).await?;
        apply_operator_manifests(&client, &namespace).await?;

        Ok(Self {
            client,
            test_namespace: namespace,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn namespace(&self) -> &str {
        &self.test_namespace
    }

    pub async fn cleanup(&self) -> anyhow::Result<()> {
        cleanup_test_namespace(&self.client, &self.test_namespace).await
    }
}

#[macro_export]
macro_rules! setup {
    () => {{ $crate::common::TestContext::new() }};
}

pub async fn create_test_namespace(client: &Client, name: &str) -> anyhow::Result<()> {
    info!("Execute tests in the namespace: {name}");

    let namespace_api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([("test".to_string(), "true".to_string())])),
            ..Default::default()
        },
        ..Default::default()
    };

    namespace_api
        .create(&Default::default(), &namespace)
        .await?;
    Ok(())
}

pub async fn cleanup_test_namespace(client: &Client, name: &str) -> anyhow::Result<()> {
    let namespace_api: Api<Namespace> = Api::all(client.clone());

    match namespace_api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted namespace {name}"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => info!("Namespace already deleted"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub fn test_namespace_name() -> String {
    format!("test-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

pub async fn wait_for_resource_deleted<K>(
    api: &Api<K>,
    resource_name: &str,
    timeout_secs: u64,
    interval_secs: u64,
) -> anyhow::Result<()>
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug,
    K: k8s_openapi::serde::de::DeserializeOwned,
{
    let poller = Poller::new()
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_interval(Duration::from_secs(interval_secs))
        .with_error_message(format!("waiting for {resource_name} to be deleted"));

    poller
        .poll_async(|| {
            let api = api.clone();
            let name = resource_name.to_string();
            async move {
                match api.get(&name).await {
                    Ok(_) => Err(format!("{name} still exists")),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                    Err(e) => Err(format!("unexpected error while fetching {name}: {e:?}")),
                }
            }
        })
        .await
}

async fn wait_for_deployment_ready(
    deployments_api: &Api<Deployment>,
    deployment_name: &str,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let poller = Poller::new()
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_interval(Duration::from_secs(5))
        .with_error_message(format!(
            "{deployment_name} deployment does not have 1 available replica after {timeout_secs} seconds"
        ));

    poller
        .poll_async(|| {
            let api = deployments_api.clone();
            let name = deployment_name.to_string();
            async move {
                let deployment = api.get(&name).await?;
                match deployment.status.and_then(|s| s.available_replicas) {
                    Some(1) => Ok(()),
                    _ => Err(anyhow::anyhow!("{name} deployment is not available yet")),
                }
            }
        })
        .await
}

async fn kubectl_apply(path: &Path) -> anyhow::Result<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path: {path:?}"))?;
    let output = Command::new("kubectl")
        .args(["apply", "-f", path_str])
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("Failed to apply {path_str}: {stderr}"));
    }
    Ok(())
}

pub async fn apply_operator_manifests(client: &Client, namespace: &str) -> anyhow::Result<()> {
    let manifests_dir = Path::new(MANIFESTS_DIR);
    std::fs::create_dir_all(manifests_dir)?;

    let image = std::env::var("OPERATOR_IMAGE")
        .unwrap_or("localhost:5000/etcd-operator/etcd-operator:latest".to_string());
    let manifest_gen_output = Command::new("../target/debug/manifest-gen")
        .args([
            "--namespace",
            namespace,
            "--output-dir",
            MANIFESTS_DIR,
            "--image",
            &image,
            "--log-level",
            "debug",
        ])
        .output()
        .await?;

    if !manifest_gen_output.status.success() {
        let stderr = String::from_utf8_lossy(&manifest_gen_output.stderr);
        return Err(anyhow::anyhow!("Failed to generate manifests: {stderr}"));
    }

    for manifest_file in [
        "etcd_cluster_crd.yaml",
        "etcd_node_deployment_crd.yaml",
        "etcd_node_set_crd.yaml",
        "etcd_node_crd.yaml",
        "operator.yaml",
    ] {
        kubectl_apply(&manifests_dir.join(manifest_file)).await?;
    }

    let deployments_api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    wait_for_deployment_ready(&deployments_api, "etcd-operator", 120).await
}
