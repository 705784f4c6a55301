//! Access to the cluster-orchestration API the actuator mutates: the join
//! token secret, the published cluster endpoint, machine annotations and events.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::api::cluster::{ApiEndpoint, Cluster};
use crate::api::machine::Machine;

pub static FIELD_MANAGER: &str = "cluster-api-provider-linode";

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> kube::Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> kube::Result<()>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> kube::Result<Cluster>;

    /// Records the API server endpoint in the cluster status.
    async fn publish_api_endpoint(&self, cluster: &Cluster, endpoint: &ApiEndpoint) -> kube::Result<()>;

    /// Sets (`Some`) or removes (`None`) machine annotations.
    async fn update_machine_annotations(
        &self,
        machine: &Machine,
        changes: &BTreeMap<String, Option<String>>,
    ) -> kube::Result<()>;

    async fn publish_event(&self, machine: &Machine, event: &Event) -> kube::Result<()>;
}

/// `ClusterStore` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> kube::Result<Option<Secret>> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn create_secret(&self, secret: &Secret) -> kube::Result<()> {
        let namespace = secret.namespace().unwrap_or(String::from("default"));
        Api::<Secret>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> kube::Result<Cluster> {
        Api::<Cluster>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }

    async fn publish_api_endpoint(&self, cluster: &Cluster, endpoint: &ApiEndpoint) -> kube::Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let patch = json!({ "status": { "apiEndpoints": [endpoint] } });
        Api::<Cluster>::namespaced(self.client.clone(), &namespace)
            .patch_status(
                &cluster.name_any(),
                &patch_params(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn update_machine_annotations(
        &self,
        machine: &Machine,
        changes: &BTreeMap<String, Option<String>>,
    ) -> kube::Result<()> {
        let namespace = machine.namespace().unwrap_or_default();
        // merge patch: null removes the key
        let patch = json!({ "metadata": { "annotations": changes } });
        Api::<Machine>::namespaced(self.client.clone(), &namespace)
            .patch(
                &machine.name_any(),
                &patch_params(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn publish_event(&self, machine: &Machine, event: &Event) -> kube::Result<()> {
        Recorder::new(self.client.clone(), self.reporter.clone())
            .publish(event, &machine.object_ref(&()))
            .await
    }
}
