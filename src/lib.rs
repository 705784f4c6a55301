use actuator::ActuatorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Actuator error: {0}")]
    ActuatorError(#[from] ActuatorError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Metrics registration error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Machine {0} has no cluster.k8s.io/cluster-name label")]
    MissingClusterLabel(String),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::ActuatorError(e) if e.is_config() => "config".to_string(),
            Error::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.metric_label(),
                _ => "finalizer".to_string(),
            },
            _ => format!("{self:?}")
                .split(['(', ' ', '{'])
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        }
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;

pub mod actuator;
pub mod api;
pub mod bootstrap;
pub mod cloud;
pub mod config;
pub mod identity;
pub mod join_token;
pub mod poll;
pub mod remote;
pub mod ssh_key;
pub mod store;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::{Diagnostics, Metrics};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_labels_name_the_variant() {
        assert_eq!(
            Error::MissingClusterLabel("worker-0".into()).metric_label(),
            "missingclusterlabel"
        );
        let config = Error::ActuatorError(ActuatorError::Config(
            api::provider_config::ProviderConfigError::Missing,
        ));
        assert_eq!(config.metric_label(), "config");
        let missing = Error::ActuatorError(ActuatorError::MissingStatus("worker-0".into()));
        assert_eq!(missing.metric_label(), "actuatorerror");
    }
}
