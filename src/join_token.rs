//! Per-cluster kubeadm join token, stored once in a Secret and never rotated.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;
use thiserror::Error;
use tracing::{info, instrument};

use crate::api::cluster::Cluster;
use crate::api::machine::CLUSTER_NAME_LABEL;
use crate::store::ClusterStore;

pub static JOIN_TOKEN_SECRET_NAME: &str = "kubeadm-join-token";
pub static JOIN_TOKEN_KEY: &str = "token";

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub type TokenResult<T> = std::result::Result<T, TokenError>;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("join token lookup error: {0}")]
    Lookup(#[source] kube::Error),

    #[error("join token create error: {0}")]
    Create(#[source] kube::Error),

    #[error("join token secret {0} has no usable `token` entry")]
    Malformed(String),
}

/// Generates a kubeadm bootstrap token of the form `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| TOKEN_CHARSET[rng.random_range(0..TOKEN_CHARSET.len())] as char)
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{id}.{secret}")
}

/// Returns the cluster's join token, creating the backing secret on first use.
///
/// Concurrent first callers for one cluster race on the create; callers are
/// expected to serialize reconciles per cluster.
#[instrument(skip_all, fields(cluster = cluster.name_any()))]
pub async fn get_or_create_join_token(store: &dyn ClusterStore, cluster: &Cluster) -> TokenResult<String> {
    let namespace = cluster.namespace().unwrap_or(String::from("default"));

    if let Some(secret) = store
        .get_secret(&namespace, JOIN_TOKEN_SECRET_NAME)
        .await
        .map_err(TokenError::Lookup)?
    {
        return secret
            .data
            .as_ref()
            .and_then(|data| data.get(JOIN_TOKEN_KEY))
            .and_then(|token| String::from_utf8(token.0.clone()).ok())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| TokenError::Malformed(format!("{namespace}/{JOIN_TOKEN_SECRET_NAME}")));
    }

    let token = generate_token();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(JOIN_TOKEN_SECRET_NAME.to_string()),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster.name_any(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            JOIN_TOKEN_KEY.to_string(),
            ByteString(token.clone().into_bytes()),
        )])),
        ..Default::default()
    };

    store
        .create_secret(&secret)
        .await
        .map_err(TokenError::Create)?;
    info!("Created join token secret");

    Ok(token)
}
