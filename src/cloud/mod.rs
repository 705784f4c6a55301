//! Linode API v4 surface used by the actuator.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::api::provider_config::ProviderConfigError;

pub mod client;
pub mod credentials;

pub use client::LinodeClient;
pub use credentials::{CredentialedClients, LinodeClients};

pub type CloudResult<T> = std::result::Result<T, CloudError>;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Linode resource not found: {0}")]
    NotFound(String),

    #[error("Linode API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Linode transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no Linode API token available for cluster {0}")]
    MissingCredentials(String),

    #[error("credential secret lookup error: {0}")]
    CredentialLookup(#[from] kube::Error),

    #[error("cluster provider config error: {0}")]
    ClusterConfig(#[from] ProviderConfigError),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Offline,
    Booting,
    Rebooting,
    ShuttingDown,
    Provisioning,
    Deleting,
    Migrating,
    Rebuilding,
    Cloning,
    Restoring,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Instance {
    pub id: u64,
    pub label: String,
    pub region: String,
    #[serde(rename = "type", default)]
    pub instance_type: String,
    #[serde(default)]
    pub image: Option<String>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ipv4: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

impl Instance {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_networked(&self) -> bool {
        !self.ipv4.is_empty()
    }

    /// First address outside the RFC 1918 ranges.
    pub fn public_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4.iter().copied().find(|ip| !ip.is_private())
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct InstanceCreateRequest {
    pub label: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub image: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authorized_keys: Vec<String>,
    pub backups_enabled: bool,
    pub private_ip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<InstanceMetadata>,
}

/// Metadata service payload; `user_data` is base64 encoded.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct InstanceMetadata {
    pub user_data: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct SshKey {
    pub id: u64,
    pub label: String,
    pub ssh_key: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SshKeyCreateRequest {
    pub label: String,
    pub ssh_key: String,
}

/// Operations against a single Linode account.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinodeApi: Send + Sync {
    async fn get_instance(&self, id: u64) -> CloudResult<Instance>;

    async fn list_instances(&self) -> CloudResult<Vec<Instance>>;

    async fn create_instance(&self, request: &InstanceCreateRequest) -> CloudResult<Instance>;

    async fn delete_instance(&self, id: u64) -> CloudResult<()>;

    async fn list_ssh_keys(&self) -> CloudResult<Vec<SshKey>>;

    async fn create_ssh_key(&self, request: &SshKeyCreateRequest) -> CloudResult<SshKey>;

    async fn delete_ssh_key(&self, id: u64) -> CloudResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_instance_payload() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "id": 123,
            "label": "demo-master-0",
            "region": "us-east",
            "type": "g6-standard-2",
            "image": "linode/ubuntu18.04",
            "status": "running",
            "tags": ["5d1c7a4e", "env:test"],
            "ipv4": ["192.168.130.4", "198.51.100.7"],
            "ipv6": "2600:3c03::f03c:91ff:fe24:3a2f/128",
            "hypervisor": "kvm",
            "specs": { "disk": 81920 }
        }))
        .unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert!(instance.has_tag("5d1c7a4e"));
        assert!(instance.is_networked());
        assert_eq!(
            instance.public_ipv4(),
            Some(Ipv4Addr::new(198, 51, 100, 7))
        );
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "id": 1,
            "label": "x",
            "region": "us-east",
            "status": "resizing"
        }))
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::Unknown);
        assert!(!instance.is_networked());
        assert_eq!(instance.public_ipv4(), None);
    }
}
