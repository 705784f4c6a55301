//! Maps a Machine to the Linode instance backing it.
//!
//! The `instance-id` annotation is authoritative once written. Before that,
//! the instance is found by its `<cluster>-<machine>` label and only accepted
//! when it carries the machine's owner tag.

use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::api::cluster::Cluster;
use crate::api::machine::{Machine, ID_ANNOTATION};
use crate::cloud::{CloudError, Instance, InstanceStatus, LinodeApi};

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("annotation instance-id holds a non-numeric id: {0}")]
    InvalidAnnotation(String),

    #[error("machine {0} has no uid to match instance tags against")]
    MissingUid(String),

    #[error("{0}")]
    Cloud(#[from] CloudError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineIdentity {
    ByAnnotation(u64),
    Unresolved,
}

impl MachineIdentity {
    pub fn of(machine: &Machine) -> ResolveResult<Self> {
        match machine.annotation(ID_ANNOTATION).map(str::trim) {
            None | Some("") => Ok(Self::Unresolved),
            Some(raw) => raw
                .parse()
                .map(Self::ByAnnotation)
                .map_err(|_| ResolveError::InvalidAnnotation(raw.to_string())),
        }
    }
}

/// Label given to the instance backing `machine`.
pub fn instance_label(cluster: &Cluster, machine: &Machine) -> String {
    format!("{}-{}", cluster.name_any(), machine.name_any())
}

/// Finds the instance for `machine`, `None` when no instance exists.
#[instrument(skip_all, fields(machine = machine.name_any()))]
pub async fn resolve(api: &dyn LinodeApi, cluster: &Cluster, machine: &Machine) -> ResolveResult<Option<Instance>> {
    match MachineIdentity::of(machine)? {
        MachineIdentity::ByAnnotation(id) => match api.get_instance(id).await {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => {
                debug!(id, "annotated instance no longer exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        },
        MachineIdentity::Unresolved => {
            let owner = machine
                .owner_tag()
                .ok_or_else(|| ResolveError::MissingUid(machine.name_any()))?;
            let label = instance_label(cluster, machine);

            let found = api.list_instances().await?.into_iter().find(|instance| {
                instance.label == label
                    && instance.has_tag(owner)
                    && instance.status != InstanceStatus::Deleting
            });
            debug!(%label, found = found.is_some(), "searched instances by label");
            Ok(found)
        }
    }
}
