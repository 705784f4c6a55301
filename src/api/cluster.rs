use std::fmt::Display;

use super::machine::ProviderSpec;
use super::prelude::*;

/// ClusterSpec describes the networking and provider settings shared by all machines.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters"
)]
#[kube(namespaced)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub cluster_network: ClusterNetworkingConfig,

    /// Provider specific configuration, decoded as a `LinodeClusterProviderConfig`.
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkingConfig {
    #[serde(default)]
    pub services: NetworkRanges,
    #[serde(default)]
    pub pods: NetworkRanges,
    #[serde(default)]
    pub service_domain: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Endpoints the cluster API server is reachable on, published by the
    /// first master machine.
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

impl Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Cluster {
    pub fn api_endpoint(&self) -> Option<&ApiEndpoint> {
        self.status.as_ref()?.api_endpoints.first()
    }

    pub fn pod_cidr(&self) -> Option<&str> {
        self.spec
            .cluster_network
            .pods
            .cidr_blocks
            .first()
            .map(String::as_str)
    }

    pub fn service_cidr(&self) -> Option<&str> {
        self.spec
            .cluster_network
            .services
            .cidr_blocks
            .first()
            .map(String::as_str)
    }
}
