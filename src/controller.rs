use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::controller::{Action, Controller},
    runtime::finalizer::{finalizer, Event as Finalizer},
    runtime::watcher::Config,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::actuator::Actuator;
use crate::api::cluster::Cluster;
use crate::api::machine::Machine;
use crate::cloud::CredentialedClients;
use crate::config::ActuatorConfig;
use crate::remote::OpenSsh;
use crate::store::KubeStore;
use crate::{telemetry, Diagnostics, Error, Metrics, Result};

pub static MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Machine actuator
    pub actuator: Arc<Actuator>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
    /// Delay before a failed reconcile is retried
    pub requeue: Duration,
}

#[instrument(skip(ctx, machine), fields(trace_id))]
async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = machine.namespace().unwrap_or_default();
    let machines: Api<Machine> = Api::namespaced(ctx.client.clone(), &namespace);

    debug!(name = machine.name_any(), namespace, "Reconciling");
    finalizer(&machines, MACHINE_FINALIZER, machine, |event| async {
        match event {
            Finalizer::Apply(machine) => apply(&machine, &ctx).await,
            Finalizer::Cleanup(machine) => cleanup(&machine, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// Creates the instance for a new machine, or converges an existing one.
async fn apply(machine: &Machine, ctx: &Context) -> Result<Action> {
    let Some(cluster) = owning_cluster(machine, ctx).await? else {
        warn!("cluster for machine does not exist yet");
        return Ok(Action::requeue(ctx.requeue));
    };

    if ctx.actuator.exists(&cluster, machine).await? {
        ctx.metrics.operation("update");
        ctx.actuator.update(&cluster, machine).await?;
    } else {
        ctx.metrics.operation("create");
        ctx.actuator.create(&cluster, machine).await?;
    }

    Ok(Action::await_change())
}

async fn cleanup(machine: &Machine, ctx: &Context) -> Result<Action> {
    match owning_cluster(machine, ctx).await? {
        Some(cluster) => {
            ctx.metrics.operation("delete");
            ctx.actuator.delete(&cluster, machine).await?;
        }
        // without the cluster there are no credentials to reach the instance with
        None => warn!("cluster is gone, releasing machine without deleting its instance"),
    }

    Ok(Action::await_change())
}

async fn owning_cluster(machine: &Machine, ctx: &Context) -> Result<Option<Cluster>> {
    let name = machine
        .cluster_name()
        .ok_or_else(|| Error::MissingClusterLabel(machine.name_any()))?;
    let namespace = machine.namespace().unwrap_or_default();

    Ok(Api::<Cluster>::namespaced(ctx.client.clone(), &namespace)
        .get_opt(name)
        .await?)
}

fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&machine, error);
    Action::requeue(ctx.requeue)
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, client: Client, config: &ActuatorConfig) -> Result<Arc<Context>> {
        let reporter = self.diagnostics.read().await.reporter.clone();
        let store = Arc::new(KubeStore::new(client.clone(), reporter));
        let clouds = Arc::new(CredentialedClients::new(
            store.clone(),
            config.linode_api_url.clone(),
            config.linode_token.clone(),
        ));
        let shell = Arc::new(OpenSsh::new(config.remote_command_timeout));
        let actuator = Actuator::new(store, clouds, shell, config).await?;

        Ok(Arc::new(Context {
            client,
            actuator: Arc::new(actuator),
            metrics: Metrics::default().register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
            requeue: config.requeue,
        }))
    }
}

/// Initialize the machine controller and shared state (given the crds are installed)
pub async fn run(state: State, config: ActuatorConfig) -> Result<()> {
    let client = Client::try_default().await?;
    let machines = Api::<Machine>::all(client.clone());
    if let Err(e) = machines.list(&ListParams::default().limit(1)).await {
        error!("Machines are not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let ctx = state.to_context(client, &config).await?;
    info!("Starting machine controller");
    Controller::new(machines, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
