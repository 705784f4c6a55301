//! Configuration for the machine actuator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cloud::client::DEFAULT_API_URL;
use crate::poll::PollConfig;

const DEFAULT_PRIVATE_KEY: &str = "/etc/sshkeys/private";
const DEFAULT_PUBLIC_KEY: &str = "/etc/sshkeys/public";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} must be a number of seconds, got {value:?}")]
    InvalidSeconds { var: &'static str, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Actuator configuration.
#[derive(Debug, Clone)]
pub struct ActuatorConfig {
    /// Token used when a cluster does not name a credential secret.
    pub linode_token: Option<String>,

    /// Linode API base URL.
    pub linode_api_url: String,

    /// User for remote shell sessions.
    pub ssh_user: String,

    /// Private key for remote shell sessions.
    pub ssh_private_key_path: Option<PathBuf>,

    /// Public key installed on every created instance.
    pub ssh_public_key_path: Option<PathBuf>,

    /// Wait for a created instance to be tagged and networked.
    pub instance_poll: PollConfig,

    /// Wait for a master to publish the cluster endpoint.
    pub endpoint_poll: PollConfig,

    /// Deadline for each remote command.
    pub remote_command_timeout: Duration,

    /// Delay before a failed reconcile is retried.
    pub requeue: Duration,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            linode_token: None,
            linode_api_url: DEFAULT_API_URL.to_string(),
            ssh_user: "root".to_string(),
            ssh_private_key_path: None,
            ssh_public_key_path: None,
            instance_poll: PollConfig::new(Duration::from_secs(10), Duration::from_secs(300)),
            endpoint_poll: PollConfig::new(Duration::from_secs(10), Duration::from_secs(600)),
            remote_command_timeout: Duration::from_secs(600),
            requeue: Duration::from_secs(300),
        }
    }
}

impl ActuatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let secs = |name: &'static str, default: Duration| -> ConfigResult<Duration> {
            match var(name) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidSeconds { var: name, value }),
                None => Ok(default),
            }
        };

        // mounted key pair is used when present
        let key_path = |name: &str, fallback: &str| {
            var(name)
                .map(PathBuf::from)
                .or_else(|| Path::new(fallback).exists().then(|| PathBuf::from(fallback)))
        };

        Ok(Self {
            linode_token: var("LINODE_TOKEN"),
            linode_api_url: var("LINODE_API_URL").unwrap_or(defaults.linode_api_url),
            ssh_user: var("SSH_USER").unwrap_or(defaults.ssh_user),
            ssh_private_key_path: key_path("SSH_PRIVATE_KEY_PATH", DEFAULT_PRIVATE_KEY),
            ssh_public_key_path: key_path("SSH_PUBLIC_KEY_PATH", DEFAULT_PUBLIC_KEY),
            instance_poll: PollConfig::new(
                secs("INSTANCE_POLL_INTERVAL_SECS", defaults.instance_poll.interval)?,
                secs("INSTANCE_POLL_TIMEOUT_SECS", defaults.instance_poll.timeout)?,
            ),
            endpoint_poll: PollConfig::new(
                secs("ENDPOINT_POLL_INTERVAL_SECS", defaults.endpoint_poll.interval)?,
                secs("ENDPOINT_POLL_TIMEOUT_SECS", defaults.endpoint_poll.timeout)?,
            ),
            remote_command_timeout: secs(
                "REMOTE_COMMAND_TIMEOUT_SECS",
                defaults.remote_command_timeout,
            )?,
            requeue: secs("REQUEUE_SECS", defaults.requeue)?,
        })
    }
}
