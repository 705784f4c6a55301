use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::{Actuator, ActuatorError, ActuatorResult};
use crate::api::cluster::{ApiEndpoint, Cluster};
use crate::api::machine::{
    Machine, MachineSnapshot, MachineVersionInfo, ID_ANNOTATION, NAME_ANNOTATION,
    REGION_ANNOTATION, STATUS_ANNOTATION,
};
use crate::api::provider_config::LinodeMachineProviderConfig;
use crate::cloud::Instance;
use crate::identity;
use crate::remote::{RemoteTarget, ShellSession};

const SSH_PORT: u16 = 22;
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Compares the fields that drive provisioning. Status and object metadata are ignored.
pub fn spec_equals(current: &MachineSnapshot, goal: &MachineSnapshot) -> bool {
    current.spec.metadata == goal.spec.metadata
        && current.spec.provider_spec == goal.spec.provider_spec
        && versions_equals(&current.spec.versions, &goal.spec.versions)
}

pub fn versions_equals(current: &MachineVersionInfo, goal: &MachineVersionInfo) -> bool {
    current.kubelet == goal.kubelet && current.control_plane == goal.control_plane
}

pub fn requires_update(current: &MachineSnapshot, goal: &MachineSnapshot) -> bool {
    !spec_equals(current, goal)
}

/// One in-place upgrade of a master, run over a single shell session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeStep {
    ControlPlane(String),
    Kubelet(String),
}

impl UpgradeStep {
    pub fn version(&self) -> &str {
        match self {
            UpgradeStep::ControlPlane(v) | UpgradeStep::Kubelet(v) => v.trim_start_matches('v'),
        }
    }

    /// Commands run on the master, in order. `node` is the node name of the master.
    pub fn commands(&self, node: &str) -> Vec<String> {
        let version = self.version();
        match self {
            UpgradeStep::ControlPlane(_) => vec![
                format!("sudo apt-get install -y --allow-change-held-packages kubeadm={version}-00"),
                format!("sudo kubeadm upgrade apply v{version} -y"),
            ],
            UpgradeStep::Kubelet(_) => vec![
                format!("sudo kubectl drain --kubeconfig={ADMIN_KUBECONFIG} --ignore-daemonsets {node}"),
                format!("sudo apt-get install -y --allow-change-held-packages kubelet={version}-00"),
                "sudo systemctl restart kubelet".to_string(),
                format!("sudo kubectl uncordon --kubeconfig={ADMIN_KUBECONFIG} {node}"),
            ],
        }
    }

    /// Marks the step as applied in `snapshot`.
    pub fn record(&self, snapshot: &mut MachineSnapshot) {
        match self {
            UpgradeStep::ControlPlane(v) => snapshot.spec.versions.control_plane = Some(v.clone()),
            UpgradeStep::Kubelet(v) => snapshot.spec.versions.kubelet = v.clone(),
        }
    }
}

/// Version changes applied in place, control plane first.
pub fn upgrade_steps(current: &MachineVersionInfo, goal: &MachineVersionInfo) -> Vec<UpgradeStep> {
    let mut steps = Vec::new();
    if current.control_plane != goal.control_plane {
        if let Some(version) = &goal.control_plane {
            steps.push(UpgradeStep::ControlPlane(version.clone()));
        }
    }
    if current.kubelet != goal.kubelet {
        steps.push(UpgradeStep::Kubelet(goal.kubelet.clone()));
    }
    steps
}

impl Actuator {
    pub(super) async fn update_machine(&self, cluster: &Cluster, goal: &Machine) -> ActuatorResult<Option<String>> {
        let config = LinodeMachineProviderConfig::from_spec(&goal.spec)?;

        let api = self.clouds.client_for(cluster).await?;
        let instance = identity::resolve(api.as_ref(), cluster, goal)
            .await?
            .ok_or_else(|| ActuatorError::MissingInstance(goal.name_any()))?;

        let current = MachineSnapshot::from_annotations(goal)
            .map_err(ActuatorError::InvalidStatus)?
            .ok_or_else(|| ActuatorError::MissingStatus(goal.name_any()))?;
        let desired = MachineSnapshot::from(goal);

        let restored = self.restore_endpoint(cluster, &config, &instance).await?;
        if !requires_update(&current, &desired) {
            return Ok(restored.map(|endpoint| format!("Published cluster endpoint {endpoint}")));
        }

        if config.is_master() {
            let endpoint = cluster
                .api_endpoint()
                .cloned()
                .or(restored)
                .ok_or_else(|| ActuatorError::NoEndpoint(cluster.name_any()))?;
            self.upgrade_master(goal, &config, &instance, endpoint, current, desired)
                .await
        } else {
            self.recreate(cluster, goal, &instance).await
        }
    }

    #[instrument(skip_all, fields(id = instance.id))]
    async fn upgrade_master(
        &self,
        goal: &Machine,
        config: &LinodeMachineProviderConfig,
        instance: &Instance,
        endpoint: ApiEndpoint,
        current: MachineSnapshot,
        desired: MachineSnapshot,
    ) -> ActuatorResult<Option<String>> {
        let steps = upgrade_steps(&current.spec.versions, &desired.spec.versions);
        if steps.is_empty() {
            warn!("master changes other than versions are not applied");
            return Ok(None);
        }
        config.image_profile()?;

        let target = RemoteTarget {
            host: endpoint.host,
            port: SSH_PORT,
            user: self.ssh_user.clone(),
            private_key: self
                .ssh_private_key
                .clone()
                .ok_or(ActuatorError::MissingPrivateKey)?,
        };

        let mut snapshot = current;
        for step in &steps {
            let mut session = self.shell.open(&target).await?;
            let outcome = self
                .apply_step(session.as_mut(), goal, step, &instance.label, &mut snapshot)
                .await;
            let closed = session.close().await;
            outcome?;
            closed?;
            info!(?step, "upgrade step applied");
        }

        if snapshot != desired {
            self.write_status(goal, &desired).await?;
        }

        let applied: Vec<String> = steps
            .iter()
            .map(|step| match step {
                UpgradeStep::ControlPlane(v) => format!("control plane {v}"),
                UpgradeStep::Kubelet(v) => format!("kubelet {v}"),
            })
            .collect();
        Ok(Some(format!(
            "Upgraded {} to {}",
            goal.name_any(),
            applied.join(", ")
        )))
    }

    /// Runs the step's commands, stopping at the first failure, then records it.
    async fn apply_step(
        &self,
        session: &mut dyn ShellSession,
        goal: &Machine,
        step: &UpgradeStep,
        node: &str,
        snapshot: &mut MachineSnapshot,
    ) -> ActuatorResult<()> {
        for command in step.commands(node) {
            session.execute(&command).await?;
        }
        step.record(snapshot);
        self.write_status(goal, snapshot).await
    }

    async fn write_status(&self, machine: &Machine, snapshot: &MachineSnapshot) -> ActuatorResult<()> {
        let raw = snapshot
            .to_annotation()
            .map_err(ActuatorError::InvalidStatus)?;
        let changes = BTreeMap::from([(STATUS_ANNOTATION.to_string(), Some(raw))]);
        self.store
            .update_machine_annotations(machine, &changes)
            .await?;
        Ok(())
    }

    /// Replaces a worker: the old instance is deleted and a new one created from `goal`.
    #[instrument(skip_all, fields(id = instance.id))]
    async fn recreate(&self, cluster: &Cluster, goal: &Machine, instance: &Instance) -> ActuatorResult<Option<String>> {
        let api = self.clouds.client_for(cluster).await?;
        self.destroy(api.as_ref(), instance).await?;

        let keys = [
            NAME_ANNOTATION,
            ID_ANNOTATION,
            REGION_ANNOTATION,
            STATUS_ANNOTATION,
        ];
        let cleared: BTreeMap<String, Option<String>> =
            keys.iter().map(|key| (key.to_string(), None)).collect();
        self.store
            .update_machine_annotations(goal, &cleared)
            .await?;

        let mut fresh = goal.clone();
        for key in keys {
            fresh.annotations_mut().remove(key);
        }

        info!("replacing worker instance");
        match self.create_instance(cluster, &fresh).await? {
            Some(created) => Ok(Some(format!("Replaced instance {}: {created}", instance.id))),
            None => Ok(None),
        }
    }
}
