//! Remote command execution on provisioned instances.
//!
//! [`OpenSsh`] drives the system `ssh` binary with a control master so all
//! commands of one session share a single authenticated connection.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ssh connection to {target} failed: {stderr}")]
    Connect { target: String, stderr: String },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
}

impl Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Opens sessions to remote hosts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn open(&self, target: &RemoteTarget) -> RemoteResult<Box<dyn ShellSession>>;
}

/// An open connection. Callers must `close` it on every path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShellSession: Send {
    /// Runs `command`, returning its stdout.
    async fn execute(&mut self, command: &str) -> RemoteResult<String>;

    async fn close(&mut self) -> RemoteResult<()>;
}

/// [`RemoteShell`] backed by the OpenSSH client.
#[derive(Clone, Debug)]
pub struct OpenSsh {
    command_timeout: Duration,
    connect_timeout: Duration,
}

impl OpenSsh {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl RemoteShell for OpenSsh {
    #[instrument(skip_all, fields(target = %target))]
    async fn open(&self, target: &RemoteTarget) -> RemoteResult<Box<dyn ShellSession>> {
        let socket = std::env::temp_dir().join(format!("capl-ssh-{}", uuid::Uuid::new_v4()));
        let session = OpenSshSession {
            target: target.clone(),
            socket,
            command_timeout: self.command_timeout,
        };

        let output = run(
            session.master_args(self.connect_timeout),
            "ssh control master",
            self.connect_timeout,
        )
        .await?;
        if !output.status.success() {
            return Err(RemoteError::Connect {
                target: target.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("opened ssh session");
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    target: RemoteTarget,
    socket: PathBuf,
    command_timeout: Duration,
}

impl OpenSshSession {
    fn common_args(&self) -> Vec<String> {
        vec![
            "-S".into(),
            self.socket.display().to_string(),
            "-p".into(),
            self.target.port.to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
        ]
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn master_args(&self, connect_timeout: Duration) -> Vec<String> {
        let mut args = vec!["-M".into(), "-f".into(), "-N".into()];
        args.extend(self.common_args());
        args.extend([
            "-i".into(),
            self.target.private_key.display().to_string(),
            "-o".into(),
            "ControlPersist=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", connect_timeout.as_secs()),
            self.destination(),
        ]);
        args
    }

    fn command_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.extend([self.destination(), "--".into(), command.into()]);
        args
    }

    fn exit_args(&self) -> Vec<String> {
        let mut args = self.common_args();
        args.extend(["-O".into(), "exit".into(), self.destination()]);
        args
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    #[instrument(skip(self), fields(target = %self.target))]
    async fn execute(&mut self, command: &str) -> RemoteResult<String> {
        let output = run(self.command_args(command), command, self.command_timeout).await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("remote command finished");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn close(&mut self) -> RemoteResult<()> {
        let output = run(self.exit_args(), "ssh -O exit", Duration::from_secs(10)).await?;
        if !output.status.success() {
            warn!(target = %self.target, "control master did not exit cleanly");
        }
        Ok(())
    }
}

async fn run(args: Vec<String>, what: &str, timeout: Duration) -> RemoteResult<Output> {
    let child = Command::new("ssh")
        .args(&args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(RemoteError::Timeout {
            command: what.to_string(),
            timeout,
        }),
    }
}
