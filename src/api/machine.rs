use kube::ResourceExt as _;

use super::prelude::*;

/// Label carrying the name of the Cluster a Machine belongs to.
pub static CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

pub static NAME_ANNOTATION: &str = "instance-name";
pub static ID_ANNOTATION: &str = "instance-id";
pub static REGION_ANNOTATION: &str = "instance-region";
/// JSON snapshot of the machine spec the instance was last reconciled against.
pub static STATUS_ANNOTATION: &str = "instance-status";

/// MachineSpec describes the desired state of a single cluster member.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines"
)]
#[kube(namespaced)]
#[kube(status = "MachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Metadata propagated to the Node backing this machine.
    #[serde(default)]
    pub metadata: NodeMetadata,

    /// Provider specific configuration, decoded as a `LinodeMachineProviderConfig`.
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Kubernetes component versions for this machine.
    #[serde(default)]
    pub versions: MachineVersionInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Opaque provider configuration embedded in Machine and Cluster specs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    pub kubelet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The portion of a Machine that drives provisioning, recorded in the
/// `instance-status` annotation after a successful create or upgrade.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub spec: MachineSpec,
}

impl From<&Machine> for MachineSnapshot {
    fn from(machine: &Machine) -> Self {
        Self {
            name: machine.name_any(),
            namespace: machine.namespace(),
            spec: machine.spec.clone(),
        }
    }
}

impl MachineSnapshot {
    /// Reads the recorded snapshot, `None` when the annotation was never written.
    pub fn from_annotations(machine: &Machine) -> serde_json::Result<Option<Self>> {
        machine
            .annotations()
            .get(STATUS_ANNOTATION)
            .filter(|raw| !raw.is_empty())
            .map(|raw| serde_json::from_str(raw))
            .transpose()
    }

    pub fn to_annotation(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Machine {
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_NAME_LABEL).map(String::as_str)
    }

    /// Unique identifier used to tag instances owned by this machine.
    pub fn owner_tag(&self) -> Option<&str> {
        self.metadata.uid.as_deref().filter(|uid| !uid.is_empty())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }
}
