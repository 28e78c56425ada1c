// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use kube::Client;
use log::info;

use operator::config::OperatorConfig;
use operator::expectations::Expectations;
use operator::probe::HttpsProbe;
use operator::ssh::OpenSsh;
use operator::store::KubeStore;
use operator::{ContextData, cluster, deployment, node, nodeset};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = OperatorConfig::parse();

    let client = Client::try_default().await?;
    let expectations = Arc::new(Expectations::with_timeout(config.expectations_timeout()));
    let context = Arc::new(ContextData {
        store: KubeStore::new(client.clone()),
        expectations: expectations.clone(),
        shell: Arc::new(OpenSsh::new(config.ssh_dial_timeout())),
        prober: Arc::new(HttpsProbe::new(config.probe_timeout())),
        config: Arc::new(config),
    });
    info!("etcd operator");

    tokio::spawn(nodeset::launch_node_observer(client, expectations));
    tokio::join!(
        cluster::launch_cluster_controller(context.clone()),
        deployment::launch_deployment_controller(context.clone()),
        nodeset::launch_nodeset_controller(context.clone()),
        node::launch_node_controller(context),
    );
    Ok(())
}
