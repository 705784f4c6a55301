//! Idempotent provisioning of SSH public keys into the Linode account.

use std::path::Path;

use base64::prelude::*;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument};

use crate::cloud::{CloudError, LinodeApi, SshKey, SshKeyCreateRequest};

pub type KeyResult<T> = std::result::Result<T, KeyError>;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("malformed public key: {0}")]
    Malformed(String),

    #[error("public key read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("key upload error: {0}")]
    Cloud(#[from] CloudError),
}

/// Label prefix marking account keys uploaded on behalf of a machine.
pub static OWNED_LABEL_PREFIX: &str = "capl-";

/// Label of the keys uploaded for the machine with uid `owner`.
pub fn owner_label(owner: &str) -> String {
    format!("{OWNED_LABEL_PREFIX}{owner}")
}

/// An OpenSSH public key with its SHA256 fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct PublicKey {
    pub material: String,
    pub fingerprint: String,
}

impl PublicKey {
    /// Parses an authorized_keys style line: `<type> <base64 blob> [comment]`.
    pub fn parse(material: &str) -> KeyResult<Self> {
        let material = material.trim();
        let mut fields = material.split_whitespace();
        let (Some(kind), Some(encoded)) = (fields.next(), fields.next()) else {
            return Err(KeyError::Malformed("expected `<type> <key>`".into()));
        };

        let blob = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;

        // the blob starts with the length prefixed key type
        let embedded = blob
            .get(..4)
            .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
            .and_then(|len| blob.get(4..4 + len));
        if embedded != Some(kind.as_bytes()) {
            return Err(KeyError::Malformed(format!(
                "key blob does not match type {kind}"
            )));
        }

        Ok(Self {
            material: material.to_string(),
            fingerprint: fingerprint(&blob),
        })
    }

    pub async fn from_file(path: &Path) -> KeyResult<Self> {
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    fn matches(&self, uploaded: &SshKey) -> bool {
        PublicKey::parse(&uploaded.ssh_key)
            .map(|key| key.fingerprint == self.fingerprint)
            .unwrap_or(false)
    }
}

fn fingerprint(blob: &[u8]) -> String {
    format!(
        "SHA256:{}",
        BASE64_STANDARD_NO_PAD.encode(Sha256::digest(blob))
    )
}

/// Uploads the key under `label` unless one with the same fingerprint already exists.
#[instrument(skip_all, fields(fingerprint = %key.fingerprint))]
pub async fn ensure_key(api: &dyn LinodeApi, key: &PublicKey, label: &str) -> KeyResult<()> {
    let existing = api.list_ssh_keys().await?;
    if existing.iter().any(|uploaded| key.matches(uploaded)) {
        info!("SSH key already present in account");
        return Ok(());
    }

    api.create_ssh_key(&SshKeyCreateRequest {
        label: label.to_string(),
        ssh_key: key.material.clone(),
    })
    .await?;
    info!(label, "uploaded SSH key");
    Ok(())
}

/// Removes the account keys uploaded under `label`. Keys added any other way are kept.
#[instrument(skip(api))]
pub async fn delete_owned_keys(api: &dyn LinodeApi, label: &str) -> KeyResult<usize> {
    let mut deleted = 0;
    for uploaded in api.list_ssh_keys().await? {
        if uploaded.label == label {
            api.delete_ssh_key(uploaded.id).await?;
            info!(id = uploaded.id, "deleted SSH key");
            deleted += 1;
        }
    }
    Ok(deleted)
}
