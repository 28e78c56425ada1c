// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Boot payload of node instances: a cloud-config document that installs the
//! operator's SSH key, the cluster CA and the `etcd-bootstrap` script.

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose};
use minijinja::{Environment, UndefinedBehavior, context};

use crate::config::OperatorConfig;

const BOOTSTRAP_TEMPLATE: &str = include_str!("../templates/etcd-bootstrap.sh.j2");
const CLOUD_CONFIG_TEMPLATE: &str = include_str!("../templates/cloud-config.yaml.j2");

/// Key of the cloud-init payload inside the userdata secret.
pub const USERDATA_KEY: &str = "userdata";

#[derive(Debug, Clone)]
pub struct BootParameters<'a> {
    pub node_name: &'a str,
    pub namespace: &'a str,
    pub peer_ip: &'a str,
    pub cluster_endpoint: &'a str,
    pub etcd_version: &'a str,
    pub authorized_key: &'a str,
    pub ca_cert_pem: &'a str,
    pub ca_key_pem: &'a str,
    pub login_password: Option<&'a str>,
}

fn environment() -> anyhow::Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_template("bootstrap", BOOTSTRAP_TEMPLATE)
        .context("invalid bootstrap template")?;
    env.add_template("cloud-config", CLOUD_CONFIG_TEMPLATE)
        .context("invalid cloud-config template")?;
    Ok(env)
}

pub fn render_bootstrap_script(
    config: &OperatorConfig,
    params: &BootParameters,
) -> anyhow::Result<String> {
    let env = environment()?;
    let ctx = context! {
        node_name => params.node_name,
        namespace => params.namespace,
        peer_ip => params.peer_ip,
        cluster_endpoint => params.cluster_endpoint,
        etcd_version => params.etcd_version,
        etcd_release_url => config.etcd_release_url,
        cfssl_release_url => config.cfssl_release_url,
        cfssl_version => config.cfssl_version,
    };
    env.get_template("bootstrap")?
        .render(ctx)
        .context("failed to render bootstrap script")
}

pub fn render_userdata(config: &OperatorConfig, params: &BootParameters) -> anyhow::Result<String> {
    let script = render_bootstrap_script(config, params)?;
    let env = environment()?;
    let ctx = context! {
        node_name => params.node_name,
        ssh_user => config.ssh_user,
        authorized_key => params.authorized_key.trim(),
        login_password => params.login_password,
        ca_cert_b64 => general_purpose::STANDARD.encode(params.ca_cert_pem),
        ca_key_b64 => general_purpose::STANDARD.encode(params.ca_key_pem),
        startup_script_b64 => general_purpose::STANDARD.encode(script),
    };
    env.get_template("cloud-config")?
        .render(ctx)
        .context("failed to render cloud-config")
}
