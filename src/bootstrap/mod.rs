//! Role specific bootstrap scripts delivered to instances as user data.
//!
//! Templates are compiled once into a [`TemplateRegistry`] and shared by
//! reference. Rendering a node script waits until a master has published the
//! cluster API endpoint.

use std::sync::Arc;

use kube::ResourceExt;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::api::cluster::{ApiEndpoint, Cluster};
use crate::api::machine::Machine;
use crate::api::provider_config::{LinodeMachineProviderConfig, ProviderConfigError};
use crate::identity::instance_label;
use crate::poll::{poll_until, PollConfig, PollError};
use crate::store::ClusterStore;

const MASTER_TEMPLATE: &str = "master";
const NODE_TEMPLATE: &str = "node";

pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Template failures are programming errors, not retryable conditions.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("bootstrap template error: {0}")]
    Template(#[from] minijinja::Error),
}

pub type BootstrapResult<T> = std::result::Result<T, BootstrapError>;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("{0}")]
    Render(#[from] RenderError),

    #[error("{0} is required to bootstrap this machine")]
    MissingParameter(&'static str),

    #[error("{0}")]
    Config(#[from] ProviderConfigError),

    #[error("cluster endpoint wait failed: {0}")]
    EndpointWait(#[from] PollError<kube::Error>),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MasterParams {
    pub token: String,
    pub kubelet_version: String,
    pub control_plane_version: String,
    pub hostname: String,
    pub namespace: String,
    pub machine_name: String,
    pub service_domain: String,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub docker_version: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NodeParams {
    pub token: String,
    pub kubelet_version: String,
    pub hostname: String,
    pub namespace: String,
    pub machine_name: String,
    pub service_domain: String,
    pub master_endpoint: String,
    pub docker_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptParams {
    Master(MasterParams),
    Node(NodeParams),
}

/// Compiled bootstrap templates.
pub struct TemplateRegistry {
    env: Environment<'static>,
}

impl TemplateRegistry {
    pub fn new() -> RenderResult<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_template(MASTER_TEMPLATE, include_str!("templates/master.sh"))?;
        env.add_template(NODE_TEMPLATE, include_str!("templates/node.sh"))?;
        Ok(Self { env })
    }

    pub fn render(&self, params: &ScriptParams) -> RenderResult<String> {
        let rendered = match params {
            ScriptParams::Master(p) => self.env.get_template(MASTER_TEMPLATE)?.render(p)?,
            ScriptParams::Node(p) => self.env.get_template(NODE_TEMPLATE)?.render(p)?,
        };
        Ok(rendered)
    }
}

/// Builds the bootstrap script for a machine, waiting on the cluster endpoint
/// when the machine joins an existing control plane.
pub struct ScriptGenerator {
    templates: Arc<TemplateRegistry>,
    endpoint_poll: PollConfig,
}

impl ScriptGenerator {
    pub fn new(templates: Arc<TemplateRegistry>, endpoint_poll: PollConfig) -> Self {
        Self {
            templates,
            endpoint_poll,
        }
    }

    #[instrument(skip_all, fields(machine = machine.name_any(), master = config.is_master()))]
    pub async fn generate(
        &self,
        store: &dyn ClusterStore,
        cluster: &Cluster,
        machine: &Machine,
        config: &LinodeMachineProviderConfig,
        token: &str,
    ) -> BootstrapResult<String> {
        if machine.spec.versions.kubelet.is_empty() {
            return Err(BootstrapError::MissingParameter("kubelet version"));
        }

        let docker_version = config.image_profile()?.docker_version.to_string();
        let params = if config.is_master() {
            ScriptParams::Master(MasterParams {
                token: token.to_string(),
                kubelet_version: machine.spec.versions.kubelet.clone(),
                control_plane_version: machine
                    .spec
                    .versions
                    .control_plane
                    .clone()
                    .ok_or(BootstrapError::MissingParameter("control plane version"))?,
                hostname: instance_label(cluster, machine),
                namespace: machine.namespace().unwrap_or_default(),
                machine_name: machine.name_any(),
                service_domain: cluster.spec.cluster_network.service_domain.clone(),
                pod_cidr: cluster
                    .pod_cidr()
                    .ok_or(BootstrapError::MissingParameter("pod CIDR"))?
                    .to_string(),
                service_cidr: cluster
                    .service_cidr()
                    .ok_or(BootstrapError::MissingParameter("service CIDR"))?
                    .to_string(),
                docker_version,
            })
        } else {
            let (latest, endpoint) = self.wait_for_endpoint(store, cluster).await?;
            ScriptParams::Node(NodeParams {
                token: token.to_string(),
                kubelet_version: machine.spec.versions.kubelet.clone(),
                hostname: instance_label(&latest, machine),
                namespace: machine.namespace().unwrap_or_default(),
                machine_name: machine.name_any(),
                service_domain: latest.spec.cluster_network.service_domain.clone(),
                master_endpoint: endpoint.to_string(),
                docker_version,
            })
        };

        Ok(self.templates.render(&params)?)
    }

    async fn wait_for_endpoint(
        &self,
        store: &dyn ClusterStore,
        cluster: &Cluster,
    ) -> BootstrapResult<(Cluster, ApiEndpoint)> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let (namespace, name) = (namespace.as_str(), name.as_str());

        let found = poll_until(&self.endpoint_poll, "cluster API endpoint", move || async move {
            let latest = store.get_cluster(namespace, name).await?;
            let endpoint = latest.api_endpoint().cloned();
            Ok::<_, kube::Error>(endpoint.map(|endpoint| (latest, endpoint)))
        })
        .await?;

        info!(endpoint = %found.1, "cluster has an endpoint");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::api::cluster::{ClusterSpec, ClusterStatus, NetworkRanges};
    use crate::api::machine::{MachineSpec, MachineVersionInfo, ProviderSpec};
    use crate::store::MockClusterStore;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("demo", ClusterSpec::default());
        cluster.metadata.namespace = Some("default".into());
        cluster.spec.cluster_network.pods = NetworkRanges {
            cidr_blocks: vec!["10.0.0.0/16".into()],
        };
        cluster.spec.cluster_network.services = NetworkRanges {
            cidr_blocks: vec!["10.1.0.0/16".into()],
        };
        cluster.spec.cluster_network.service_domain = "cluster.local".into();
        cluster
    }

    fn machine(role: &str) -> (Machine, LinodeMachineProviderConfig) {
        let spec = MachineSpec {
            provider_spec: ProviderSpec {
                value: Some(json!({
                    "image": "linode/ubuntu18.04",
                    "region": "us-east",
                    "type": "g6-standard-2",
                    "roles": [role]
                })),
            },
            versions: MachineVersionInfo {
                kubelet: "1.12.2".into(),
                control_plane: Some("1.12.2".into()),
            },
            ..Default::default()
        };
        let config = LinodeMachineProviderConfig::from_spec(&spec).unwrap();
        let mut machine = Machine::new(&format!("{}-0", role.to_lowercase()), spec);
        machine.metadata.namespace = Some("default".into());
        (machine, config)
    }

    fn generator() -> ScriptGenerator {
        ScriptGenerator::new(
            Arc::new(TemplateRegistry::new().unwrap()),
            PollConfig::new(Duration::from_secs(10), Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn master_script_embeds_cidrs_and_token() {
        let (machine, config) = machine("Master");
        let mut store = MockClusterStore::new();
        store.expect_get_cluster().never();

        let script = generator()
            .generate(&store, &cluster(), &machine, &config, "abcdef.0123456789abcdef")
            .await
            .unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("TOKEN=abcdef.0123456789abcdef"));
        assert!(script.contains("POD_CIDR=10.0.0.0/16"));
        assert!(script.contains("SERVICE_CIDR=10.1.0.0/16"));
        assert!(script.contains("HOSTNAME=demo-master-0"));
        assert!(script.contains("MACHINE=default/master-0"));
        assert!(script.contains("kubeadm init"));
        assert!(script.contains("swapoff -a"));
    }

    #[tokio::test]
    async fn master_requires_cluster_cidrs() {
        let (machine, config) = machine("Master");
        let mut cluster = cluster();
        cluster.spec.cluster_network.pods.cidr_blocks.clear();

        let result = generator()
            .generate(&MockClusterStore::new(), &cluster, &machine, &config, "t")
            .await;
        assert!(matches!(
            result,
            Err(BootstrapError::MissingParameter("pod CIDR"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn node_script_waits_for_master_endpoint() {
        let (machine, config) = machine("Node");
        let mut store = MockClusterStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get_cluster()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(cluster()));
        store
            .expect_get_cluster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut published = cluster();
                published.status = Some(ClusterStatus {
                    api_endpoints: vec![ApiEndpoint {
                        host: "198.51.100.7".into(),
                        port: 6443,
                    }],
                    ..Default::default()
                });
                Ok(published)
            });

        let script = generator()
            .generate(&store, &cluster(), &machine, &config, "abcdef.0123456789abcdef")
            .await
            .unwrap();

        assert!(script.contains("ENDPOINT=198.51.100.7:6443"));
        assert!(script.contains("kubeadm join"));
        assert!(!script.contains("kubeadm init"));
    }

    #[tokio::test(start_paused = true)]
    async fn node_script_times_out_without_master() {
        let (machine, config) = machine("Node");
        let mut store = MockClusterStore::new();
        store.expect_get_cluster().returning(|_, _| Ok(cluster()));

        let result = generator()
            .generate(&store, &cluster(), &machine, &config, "t")
            .await;
        assert!(matches!(
            result,
            Err(BootstrapError::EndpointWait(PollError::Timeout { .. }))
        ));
    }

    #[test]
    fn strict_rendering_has_no_leftover_placeholders() {
        let registry = TemplateRegistry::new().unwrap();
        let script = registry
            .render(&ScriptParams::Node(NodeParams {
                token: "t".into(),
                kubelet_version: "1.12.2".into(),
                hostname: "demo-node-0".into(),
                namespace: "default".into(),
                machine_name: "node-0".into(),
                service_domain: "cluster.local".into(),
                master_endpoint: "198.51.100.7:6443".into(),
                docker_version: "18.09.7-0ubuntu1~18.04.4".into(),
            }))
            .unwrap();
        assert!(!script.contains("{{"));
        assert!(script.ends_with('\n'));
    }
}
