// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use clap::Parser;
use std::time::Duration;

pub const DEFAULT_ETCD_RELEASE_URL: &str = "https://github.com/etcd-io/etcd/releases/download";
pub const DEFAULT_CFSSL_RELEASE_URL: &str = "https://github.com/cloudflare/cfssl/releases/download";
pub const DEFAULT_CFSSL_VERSION: &str = "1.6.5";
pub const DEFAULT_SSH_USER: &str = "etcd";
pub const DEFAULT_VM_MEMORY: &str = "2Gi";
pub const DEFAULT_VM_CORES: u32 = 2;
pub const DEFAULT_ROOT_DISK_SIZE: &str = "10Gi";

/// Operator settings. Every flag can also be supplied through the
/// environment, which is how the generated Deployment passes them.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "etcd-operator", about = "Runs etcd clusters on KubeVirt virtual machines")]
pub struct OperatorConfig {
    /// Base URL etcd release tarballs are downloaded from
    #[arg(long, env = "ETCD_RELEASE_URL", default_value = DEFAULT_ETCD_RELEASE_URL)]
    pub etcd_release_url: String,

    /// Base URL cfssl tool binaries are downloaded from
    #[arg(long, env = "CFSSL_RELEASE_URL", default_value = DEFAULT_CFSSL_RELEASE_URL)]
    pub cfssl_release_url: String,

    #[arg(long, env = "CFSSL_VERSION", default_value = DEFAULT_CFSSL_VERSION)]
    pub cfssl_version: String,

    /// Login provisioned on every instance for the bootstrap commands
    #[arg(long, env = "SSH_USER", default_value = DEFAULT_SSH_USER)]
    pub ssh_user: String,

    #[arg(long, env = "VM_MEMORY", default_value = DEFAULT_VM_MEMORY)]
    pub vm_memory: String,

    #[arg(long, env = "VM_CORES", default_value_t = DEFAULT_VM_CORES)]
    pub vm_cores: u32,

    #[arg(long, env = "ROOT_DISK_SIZE", default_value = DEFAULT_ROOT_DISK_SIZE)]
    pub root_disk_size: String,

    #[arg(long, env = "SSH_DIAL_TIMEOUT_SECS", default_value_t = 10)]
    pub ssh_dial_timeout_secs: u64,

    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = 2)]
    pub probe_timeout_secs: u64,

    /// Age after which unobserved creations and deletions stop blocking
    #[arg(long, env = "EXPECTATIONS_TIMEOUT_SECS", default_value_t = 300)]
    pub expectations_timeout_secs: u64,

    /// Upper bound on concurrent node creations or deletions per pass
    #[arg(long, env = "NODE_SET_BURST", default_value_t = 10)]
    pub node_set_burst: usize,

    /// Requeue interval of converged resources
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 60)]
    pub resync_interval_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            etcd_release_url: DEFAULT_ETCD_RELEASE_URL.to_string(),
            cfssl_release_url: DEFAULT_CFSSL_RELEASE_URL.to_string(),
            cfssl_version: DEFAULT_CFSSL_VERSION.to_string(),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            vm_memory: DEFAULT_VM_MEMORY.to_string(),
            vm_cores: DEFAULT_VM_CORES,
            root_disk_size: DEFAULT_ROOT_DISK_SIZE.to_string(),
            ssh_dial_timeout_secs: 10,
            probe_timeout_secs: 2,
            expectations_timeout_secs: 300,
            node_set_burst: 10,
            resync_interval_secs: 60,
        }
    }
}

impl OperatorConfig {
    pub fn ssh_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_dial_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn expectations_timeout(&self) -> Duration {
        Duration::from_secs(self.expectations_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}
