// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

pub mod conditions;
mod etcd;
mod kubevirt;

pub use etcd::*;
pub use kubevirt::*;

pub const GROUP: &str = "etcd.virt.io";

pub const LABEL_CLUSTER: &str = "etcd.virt.io/cluster";
pub const LABEL_NODE: &str = "etcd.virt.io/node";
/// Added to every Node-Set (and its nodes) so that sets created from
/// different templates never select each other's nodes.
pub const LABEL_TEMPLATE_HASH: &str = "etcd.virt.io/node-template-hash";

pub const ANNOTATION_REVISION: &str = "etcd.virt.io/revision";
pub const ANNOTATION_REVISION_HISTORY: &str = "etcd.virt.io/revision-history";
pub const ANNOTATION_DESIRED_REPLICAS: &str = "etcd.virt.io/desired-replicas";
pub const ANNOTATION_MAX_REPLICAS: &str = "etcd.virt.io/max-replicas";

pub const CLUSTER_FINALIZER: &str = "etcd.virt.io/cluster-protection";
pub const NODE_FINALIZER: &str = "etcd.virt.io/node-protection";

pub const CA_SECRET_PREFIX: &str = "ca-";
pub const CLIENT_SECRET_PREFIX: &str = "api-client-";
pub const PEER_SECRET_PREFIX: &str = "peer-";
pub const SSH_SECRET_PREFIX: &str = "ssh-keypair-";
pub const USERDATA_SECRET_PREFIX: &str = "userdata-";

pub fn ca_secret_name(owner: &str) -> String {
    format!("{CA_SECRET_PREFIX}{owner}")
}

pub fn client_secret_name(owner: &str) -> String {
    format!("{CLIENT_SECRET_PREFIX}{owner}")
}

pub fn peer_secret_name(owner: &str) -> String {
    format!("{PEER_SECRET_PREFIX}{owner}")
}

pub fn ssh_secret_name(owner: &str) -> String {
    format!("{SSH_SECRET_PREFIX}{owner}")
}

pub fn userdata_secret_name(owner: &str) -> String {
    format!("{USERDATA_SECRET_PREFIX}{owner}")
}

pub fn peer_service_name(node: &str) -> String {
    format!("{node}-peer")
}
