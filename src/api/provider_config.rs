use thiserror::Error;

use super::cluster::Cluster;
use super::machine::{MachineSpec, ProviderSpec};
use super::prelude::*;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MachineRole {
    Master,
    Node,
}

/// Linode specific machine configuration, carried in `spec.providerSpec.value`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinodeMachineProviderConfig {
    /// Image slug, e.g. `linode/ubuntu18.04`.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub region: String,
    /// Linode plan, e.g. `g6-standard-2`.
    #[serde(default, rename = "type")]
    pub instance_type: String,
    #[serde(default)]
    pub roles: Vec<MachineRole>,
    #[serde(default)]
    pub backups: bool,
    #[serde(default)]
    pub private_networking: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Authorized keys uploaded to the account and installed on the instance.
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
}

/// Linode specific cluster configuration, carried in `spec.providerSpec.value`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinodeClusterProviderConfig {
    /// Keys installed on every instance of the cluster.
    #[serde(default)]
    pub authorized_keys: Vec<String>,

    /// Secret in the cluster namespace holding the Linode API token under `token`.
    #[serde(default)]
    pub token_secret_name: Option<String>,
}

pub type ProviderConfigResult<T> = std::result::Result<T, ProviderConfigError>;

#[derive(Error, Debug)]
pub enum ProviderConfigError {
    #[error("providerSpec value is missing")]
    Missing,

    #[error("malformed providerSpec: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0} must be provided")]
    Required(&'static str),

    #[error("no container runtime known for image '{0}'")]
    UnsupportedImage(String),
}

fn decode<T: serde::de::DeserializeOwned>(spec: &ProviderSpec) -> ProviderConfigResult<T> {
    let value = spec.value.clone().ok_or(ProviderConfigError::Missing)?;
    Ok(serde_json::from_value(value)?)
}

impl LinodeMachineProviderConfig {
    /// Decodes and validates the provider config of a machine spec.
    pub fn from_spec(spec: &MachineSpec) -> ProviderConfigResult<Self> {
        let config: Self = decode(&spec.provider_spec)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProviderConfigResult<()> {
        if self.image.is_empty() {
            return Err(ProviderConfigError::Required("image"));
        }
        if self.region.is_empty() {
            return Err(ProviderConfigError::Required("region"));
        }
        if self.instance_type.is_empty() {
            return Err(ProviderConfigError::Required("type"));
        }
        if self.roles.is_empty() {
            return Err(ProviderConfigError::Required("roles"));
        }
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.roles.contains(&MachineRole::Master)
    }

    pub fn image_profile(&self) -> ProviderConfigResult<&'static ImageProfile> {
        ImageProfile::for_image(&self.image)
            .ok_or_else(|| ProviderConfigError::UnsupportedImage(self.image.clone()))
    }
}

impl LinodeClusterProviderConfig {
    /// A cluster without provider config uses the defaults.
    pub fn from_cluster(cluster: &Cluster) -> ProviderConfigResult<Self> {
        match cluster.spec.provider_spec.value {
            Some(_) => decode(&cluster.spec.provider_spec),
            None => Ok(Self::default()),
        }
    }
}

/// Per image package pins used by bootstrap and upgrade commands.
#[derive(Debug, PartialEq, Eq)]
pub struct ImageProfile {
    pub image: &'static str,
    pub docker_version: &'static str,
}

static IMAGE_PROFILES: &[ImageProfile] = &[
    ImageProfile {
        image: "linode/ubuntu16.04lts",
        docker_version: "18.09.7-0ubuntu1~16.04.5",
    },
    ImageProfile {
        image: "linode/ubuntu18.04",
        docker_version: "18.09.7-0ubuntu1~18.04.4",
    },
];

impl ImageProfile {
    pub fn for_image(image: &str) -> Option<&'static ImageProfile> {
        IMAGE_PROFILES.iter().find(|p| p.image == image)
    }
}
