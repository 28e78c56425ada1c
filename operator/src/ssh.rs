// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Remote command execution on node instances.
//!
//! The production implementation shells out to the system OpenSSH client, so
//! the operator image only needs `ssh` installed. Host keys are not pinned:
//! instances are reached through cluster-internal Service IPs and their host
//! keys are generated on first boot.

use async_trait::async_trait;
use log::debug;
use std::fmt;
use std::io::Write;
use std::process::Output;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;

/// ssh(1) reserves this exit status for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_pem: String,
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("could not reach {target}: {reason}")]
    Dial { target: String, reason: String },
    #[error("`{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SshError {
    pub fn is_dial(&self) -> bool {
        matches!(self, SshError::Dial { .. })
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn dial(&self, target: &SshTarget) -> Result<Box<dyn ShellSession>, SshError>;
}

#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Runs `command`. A non-zero exit status is an error carrying the
    /// captured stderr.
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError>;
}

pub struct OpenSsh {
    dial_timeout: Duration,
}

impl OpenSsh {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

struct OpenSshSession {
    target: SshTarget,
    identity: NamedTempFile,
    dial_timeout: Duration,
}

impl OpenSshSession {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(self.identity.path())
            .arg("-p")
            .arg(self.target.port.to_string())
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "IdentitiesOnly=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.dial_timeout.as_secs().max(1)))
            .arg(format!("{}@{}", self.target.user, self.target.host))
            .arg("--")
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }

    fn dial_error(&self, reason: impl ToString) -> SshError {
        SshError::Dial {
            target: self.target.to_string(),
            reason: reason.to_string(),
        }
    }

    fn check(&self, command: &str, output: Output) -> Result<CommandOutput, SshError> {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            Some(SSH_CONNECTION_FAILURE) | None => Err(self.dial_error(stderr)),
            Some(status) => Err(SshError::Command {
                command: command.to_string(),
                status,
                stderr,
            }),
        }
    }
}

#[async_trait]
impl RemoteShell for OpenSsh {
    async fn dial(&self, target: &SshTarget) -> Result<Box<dyn ShellSession>, SshError> {
        let mut identity = NamedTempFile::new()?;
        identity.write_all(target.private_key_pem.as_bytes())?;
        identity.flush()?;
        let session = OpenSshSession {
            target: target.clone(),
            identity,
            dial_timeout: self.dial_timeout,
        };

        debug!("dialing {target}");
        let probe = tokio::time::timeout(self.dial_timeout * 2, session.command("true").output())
            .await
            .map_err(|_| session.dial_error("timed out"))?
            .map_err(|e| session.dial_error(e))?;
        session.check("true", probe).map_err(|e| match e {
            SshError::Command { stderr, .. } => session.dial_error(stderr),
            e => e,
        })?;
        Ok(Box::new(session))
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        debug!("running `{command}` on {}", self.target);
        let output = self.command(command).output().await?;
        self.check(command, output)
    }
}
