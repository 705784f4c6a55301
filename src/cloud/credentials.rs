use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use super::{CloudError, CloudResult, LinodeApi, LinodeClient};
use crate::api::cluster::Cluster;
use crate::api::provider_config::LinodeClusterProviderConfig;
use crate::store::ClusterStore;

/// Data key holding the API token in a credential secret.
pub static TOKEN_KEY: &str = "token";

/// Hands out an API client for the account a cluster lives in.
///
/// A client is built per call so a rotated credential secret takes effect
/// without restarting the controller.
#[async_trait]
pub trait LinodeClients: Send + Sync {
    async fn client_for(&self, cluster: &Cluster) -> CloudResult<Arc<dyn LinodeApi>>;
}

pub struct CredentialedClients {
    store: Arc<dyn ClusterStore>,
    base_url: String,
    fallback_token: Option<String>,
}

impl CredentialedClients {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        base_url: impl Into<String>,
        fallback_token: Option<String>,
    ) -> Self {
        Self {
            store,
            base_url: base_url.into(),
            fallback_token,
        }
    }

    /// Cluster secret first, process-wide token second.
    pub async fn resolve_token(&self, cluster: &Cluster) -> CloudResult<String> {
        let config = LinodeClusterProviderConfig::from_cluster(cluster)?;
        let missing = || CloudError::MissingCredentials(cluster.name_any());

        if let Some(secret_name) = config.token_secret_name.as_deref() {
            let namespace = cluster.namespace().unwrap_or_default();
            debug!(secret = secret_name, namespace, "reading API token secret");
            let secret = self
                .store
                .get_secret(&namespace, secret_name)
                .await?
                .ok_or_else(missing)?;

            return secret
                .data
                .as_ref()
                .and_then(|data| data.get(TOKEN_KEY))
                .and_then(|token| String::from_utf8(token.0.clone()).ok())
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .ok_or_else(missing);
        }

        self.fallback_token.clone().ok_or_else(missing)
    }
}

#[async_trait]
impl LinodeClients for CredentialedClients {
    async fn client_for(&self, cluster: &Cluster) -> CloudResult<Arc<dyn LinodeApi>> {
        let token = self.resolve_token(cluster).await?;
        Ok(Arc::new(LinodeClient::new(self.base_url.clone(), token)?))
    }
}
