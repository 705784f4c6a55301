use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use cluster_api_provider_linode::{config::ActuatorConfig, controller, telemetry, State};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

/// Cluster API machine controller for Linode.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Address the metrics and diagnostics server listens on.
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    bind: String,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => {
            error!("failed to encode metrics: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init().await?;
    let config = ActuatorConfig::from_env()?;

    // Init k8s controller state
    let state = State::default();
    let machine_controller = controller::run(state.clone(), config);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&cli.bind)?
    .shutdown_timeout(5)
    .run();

    let (controller, server) = tokio::join!(machine_controller, server);
    controller?;
    server?;
    Ok(())
}
