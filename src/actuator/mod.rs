//! Reconciles a Machine against the Linode instance backing it.
//!
//! Every operation is safe to call again after a failure. Paths that find
//! nothing to do return before any mutation and record no event.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::prelude::*;
use kube::runtime::events::{Event, EventType};
use kube::ResourceExt;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::api::cluster::{ApiEndpoint, Cluster};
use crate::api::machine::{
    Machine, MachineSnapshot, ID_ANNOTATION, NAME_ANNOTATION, REGION_ANNOTATION,
    STATUS_ANNOTATION,
};
use crate::api::provider_config::{
    LinodeClusterProviderConfig, LinodeMachineProviderConfig, ProviderConfigError,
};
use crate::bootstrap::{BootstrapError, ScriptGenerator, TemplateRegistry};
use crate::cloud::{
    CloudError, Instance, InstanceCreateRequest, InstanceMetadata, LinodeApi, LinodeClients,
};
use crate::config::ActuatorConfig;
use crate::identity::{self, instance_label, ResolveError};
use crate::join_token::{get_or_create_join_token, TokenError};
use crate::poll::{poll_until, PollConfig, PollError};
use crate::remote::{RemoteError, RemoteShell};
use crate::ssh_key::{self, KeyError, PublicKey};
use crate::store::ClusterStore;
use crate::telemetry;

mod update;

pub use update::{requires_update, spec_equals, upgrade_steps, versions_equals, UpgradeStep};

/// Port the kubeadm API server listens on.
pub const API_SERVER_PORT: i32 = 6443;

pub type ActuatorResult<T> = std::result::Result<T, ActuatorError>;

#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("invalid provider config: {0}")]
    Config(#[from] ProviderConfigError),

    #[error("{0}")]
    Cloud(#[from] CloudError),

    #[error("instance lookup error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Token(#[from] TokenError),

    #[error("{0}")]
    Key(#[from] KeyError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("instance did not converge: {0}")]
    Converge(#[from] PollError<CloudError>),

    #[error("remote shell error: {0}")]
    Remote(#[from] RemoteError),

    #[error("machine {0} has no instance to update")]
    MissingInstance(String),

    #[error("machine {0} has no instance-status annotation")]
    MissingStatus(String),

    #[error("instance-status annotation is not a machine snapshot: {0}")]
    InvalidStatus(#[source] serde_json::Error),

    #[error("cluster {0} has not published an API endpoint")]
    NoEndpoint(String),

    #[error("instance {0} has no public IPv4 address")]
    NoPublicAddress(u64),

    #[error("no SSH private key configured for remote upgrades")]
    MissingPrivateKey,

    #[error("Kube Error: {0}")]
    Kube(#[from] kube::Error),
}

impl ActuatorError {
    /// Declared configuration is unusable; retrying without a spec change cannot succeed.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ActuatorError::Config(_)
                | ActuatorError::Cloud(CloudError::ClusterConfig(_))
                | ActuatorError::Bootstrap(BootstrapError::Config(_))
                | ActuatorError::Bootstrap(BootstrapError::MissingParameter(_))
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn reason(self) -> &'static str {
        match self {
            Operation::Create => "Create",
            Operation::Update => "Update",
            Operation::Delete => "Delete",
        }
    }

    fn action(self) -> &'static str {
        match self {
            Operation::Create => "Creating",
            Operation::Update => "Updating",
            Operation::Delete => "Deleting",
        }
    }
}

pub struct Actuator {
    store: Arc<dyn ClusterStore>,
    clouds: Arc<dyn LinodeClients>,
    shell: Arc<dyn RemoteShell>,
    scripts: ScriptGenerator,
    instance_poll: PollConfig,
    ssh_user: String,
    ssh_private_key: Option<PathBuf>,
    admin_key: Option<PublicKey>,
}

impl Actuator {
    pub async fn new(
        store: Arc<dyn ClusterStore>,
        clouds: Arc<dyn LinodeClients>,
        shell: Arc<dyn RemoteShell>,
        config: &ActuatorConfig,
    ) -> ActuatorResult<Self> {
        let templates = TemplateRegistry::new().map_err(BootstrapError::from)?;
        let admin_key = match &config.ssh_public_key_path {
            Some(path) => Some(PublicKey::from_file(path).await?),
            None => None,
        };

        Ok(Self {
            store,
            clouds,
            shell,
            scripts: ScriptGenerator::new(Arc::new(templates), config.endpoint_poll.clone()),
            instance_poll: config.instance_poll.clone(),
            ssh_user: config.ssh_user.clone(),
            ssh_private_key: config.ssh_private_key_path.clone(),
            admin_key,
        })
    }

    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = machine.name_any(), namespace = machine.namespace()), err)]
    pub async fn create(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<()> {
        let outcome = self.create_instance(cluster, machine).await;
        self.record(machine, Operation::Create, outcome).await
    }

    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = machine.name_any(), namespace = machine.namespace()), err)]
    pub async fn update(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<()> {
        let outcome = self.update_machine(cluster, machine).await;
        self.record(machine, Operation::Update, outcome).await
    }

    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = machine.name_any(), namespace = machine.namespace()), err)]
    pub async fn delete(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<()> {
        let outcome = self.delete_instance(cluster, machine).await;
        self.record(machine, Operation::Delete, outcome).await
    }

    /// Whether a live instance backs `machine`.
    #[instrument(skip_all, fields(name = machine.name_any()))]
    pub async fn exists(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<bool> {
        let api = self.clouds.client_for(cluster).await?;
        Ok(identity::resolve(api.as_ref(), cluster, machine)
            .await?
            .is_some())
    }

    /// Publishes the outcome of a mutating operation. `Ok(None)` means nothing was done.
    async fn record(
        &self,
        machine: &Machine,
        operation: Operation,
        outcome: ActuatorResult<Option<String>>,
    ) -> ActuatorResult<()> {
        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(note)) => {
                info!(note = %note, "{} succeeded", operation.reason());
                let event = Event {
                    type_: EventType::Normal,
                    reason: operation.reason().into(),
                    note: Some(note),
                    action: operation.action().into(),
                    secondary: None,
                };
                if let Err(publish) = self.store.publish_event(machine, &event).await {
                    warn!("failed to publish event: {publish}");
                }
                Ok(())
            }
            Err(e) if e.is_config() => Err(e),
            Err(e) => {
                let event = Event {
                    type_: EventType::Warning,
                    reason: format!("Failed{}", operation.reason()),
                    note: Some(e.to_string()),
                    action: operation.action().into(),
                    secondary: None,
                };
                if let Err(publish) = self.store.publish_event(machine, &event).await {
                    warn!("failed to publish failure event: {publish}");
                }
                Err(e)
            }
        }
    }

    async fn create_instance(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<Option<String>> {
        let config = LinodeMachineProviderConfig::from_spec(&machine.spec)?;
        config.image_profile()?;
        let cluster_config = LinodeClusterProviderConfig::from_cluster(cluster)?;

        let api = self.clouds.client_for(cluster).await?;
        if let Some(instance) = identity::resolve(api.as_ref(), cluster, machine).await? {
            info!(id = instance.id, "instance already exists");
            let restored = self.restore_endpoint(cluster, &config, &instance).await?;
            return Ok(restored.map(|endpoint| format!("Published cluster endpoint {endpoint}")));
        }

        let owner = machine
            .owner_tag()
            .ok_or_else(|| ResolveError::MissingUid(machine.name_any()))?;
        let keys = self.authorized_keys(&config, &cluster_config)?;

        let token = get_or_create_join_token(self.store.as_ref(), cluster).await?;
        let key_label = ssh_key::owner_label(owner);
        for key in &keys {
            ssh_key::ensure_key(api.as_ref(), key, &key_label).await?;
        }
        let script = self
            .scripts
            .generate(self.store.as_ref(), cluster, machine, &config, &token)
            .await?;

        let mut tags = config.tags.clone();
        tags.push(owner.to_string());
        let request = InstanceCreateRequest {
            label: instance_label(cluster, machine),
            region: config.region.clone(),
            instance_type: config.instance_type.clone(),
            image: config.image.clone(),
            tags,
            authorized_keys: keys.into_iter().map(|key| key.material).collect(),
            backups_enabled: config.backups,
            private_ip: config.private_networking,
            metadata: Some(InstanceMetadata {
                user_data: BASE64_STANDARD.encode(script),
            }),
        };
        let created = api.create_instance(&request).await?;
        info!(id = created.id, label = %created.label, "instance created");

        let instance = self.await_instance(api.as_ref(), created.id, owner).await?;

        let snapshot = MachineSnapshot::from(machine)
            .to_annotation()
            .map_err(ActuatorError::InvalidStatus)?;
        let annotations = BTreeMap::from([
            (NAME_ANNOTATION.to_string(), Some(instance.label.clone())),
            (ID_ANNOTATION.to_string(), Some(instance.id.to_string())),
            (REGION_ANNOTATION.to_string(), Some(instance.region.clone())),
            (STATUS_ANNOTATION.to_string(), Some(snapshot)),
        ]);
        self.store
            .update_machine_annotations(machine, &annotations)
            .await?;

        if config.is_master() {
            self.publish_endpoint(cluster, &instance).await?;
        }

        Ok(Some(format!(
            "Created instance {} ({})",
            instance.label, instance.id
        )))
    }

    async fn publish_endpoint(&self, cluster: &Cluster, instance: &Instance) -> ActuatorResult<ApiEndpoint> {
        let host = instance
            .public_ipv4()
            .ok_or(ActuatorError::NoPublicAddress(instance.id))?;
        let endpoint = ApiEndpoint {
            host: host.to_string(),
            port: API_SERVER_PORT,
        };
        self.store.publish_api_endpoint(cluster, &endpoint).await?;
        info!(%endpoint, "published cluster endpoint");
        Ok(endpoint)
    }

    /// Publishes a master's endpoint when the cluster has none recorded.
    async fn restore_endpoint(
        &self,
        cluster: &Cluster,
        config: &LinodeMachineProviderConfig,
        instance: &Instance,
    ) -> ActuatorResult<Option<ApiEndpoint>> {
        if !config.is_master() || cluster.api_endpoint().is_some() {
            return Ok(None);
        }
        self.publish_endpoint(cluster, instance).await.map(Some)
    }

    /// Waits until the instance carries the owner tag and has an address.
    async fn await_instance(&self, api: &dyn LinodeApi, id: u64, owner: &str) -> ActuatorResult<Instance> {
        let instance = poll_until(
            &self.instance_poll,
            "instance to be tagged and networked",
            move || async move {
                let instance = api.get_instance(id).await?;
                Ok::<_, CloudError>(
                    (instance.has_tag(owner) && instance.is_networked()).then_some(instance),
                )
            },
        )
        .await?;
        Ok(instance)
    }

    async fn delete_instance(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<Option<String>> {
        let api = self.clouds.client_for(cluster).await?;
        let Some(instance) = identity::resolve(api.as_ref(), cluster, machine).await? else {
            info!("no instance to delete");
            return Ok(None);
        };

        self.destroy(api.as_ref(), &instance).await?;

        // instances hold their keys by material; only the account copies this machine uploaded go
        if let Some(owner) = machine.owner_tag() {
            let label = ssh_key::owner_label(owner);
            if let Err(e) = ssh_key::delete_owned_keys(api.as_ref(), &label).await {
                warn!(label = %label, "failed to remove uploaded SSH keys: {e}");
            }
        }

        Ok(Some(format!(
            "Deleted instance {} ({})",
            instance.label, instance.id
        )))
    }

    async fn destroy(&self, api: &dyn LinodeApi, instance: &Instance) -> ActuatorResult<()> {
        match api.delete_instance(instance.id).await {
            Ok(()) => {
                info!(id = instance.id, "instance deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Machine keys, cluster wide keys and the actuator key, deduplicated.
    fn authorized_keys(
        &self,
        config: &LinodeMachineProviderConfig,
        cluster_config: &LinodeClusterProviderConfig,
    ) -> ActuatorResult<Vec<PublicKey>> {
        let mut keys: Vec<PublicKey> = Vec::new();
        let declared = config
            .ssh_public_keys
            .iter()
            .chain(&cluster_config.authorized_keys)
            .map(|material| PublicKey::parse(material))
            .chain(self.admin_key.clone().map(Ok));

        for key in declared {
            let key = key?;
            if !keys.iter().any(|k| k.fingerprint == key.fingerprint) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
