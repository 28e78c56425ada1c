// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use crate::ControllerError;
use crate::store::{Labels, ObjectStore, get_opt};

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const SSH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY: &str = "tls.key";
pub const SSH_PRIVATE_KEY: &str = "ssh-privatekey";
pub const SSH_PUBLIC_KEY: &str = "ssh-publickey";
pub const PASSWORD_KEY: &str = "password";

pub fn secret(
    name: &str,
    namespace: &str,
    type_: &str,
    data: BTreeMap<&str, String>,
    labels: Labels,
    owner: Option<OwnerReference>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Reads the named secret. A missing secret or key is something to wait for.
pub async fn read_secret<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
    keys: &[&str],
) -> Result<Vec<String>, ControllerError> {
    let secret = get_opt::<S, Secret>(store, namespace, name)
        .await?
        .ok_or_else(|| ControllerError::waiting(format!("secret {namespace}/{name}")))?;
    keys.iter()
        .map(|key| {
            secret_string(&secret, key)
                .ok_or_else(|| ControllerError::waiting(format!("key {key} in secret {namespace}/{name}")))
        })
        .collect()
}
