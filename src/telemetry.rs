use opentelemetry::trace::TraceId;
use thiserror::Error;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

const TRACER_NAME: &str = "cluster-api-provider-linode";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("tracing already initialized: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[cfg(feature = "telemetry")]
    #[error("trace exporter error: {0}")]
    Exporter(String),
}

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn init_tracer() -> Result<opentelemetry_sdk::trace::Tracer, TelemetryError> {
    use opentelemetry::trace::TracerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    let builder = SdkTracerProvider::builder();
    #[cfg(feature = "telemetry")]
    let builder = {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
        builder.with_batch_exporter(exporter)
    };
    Ok(builder.build().tracer(TRACER_NAME))
}

/// Initialize tracing
///
/// Logs are compact text unless `LOG_FORMAT=json`.
pub async fn init() -> Result<(), TelemetryError> {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    // Setup tracing layers
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer()?);
    let compact = (!json).then(|| tracing_subscriber::fmt::layer().compact());
    let structured = json.then(|| tracing_subscriber::fmt::layer().json());
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    // Decide on layers
    let collector = Registry::default()
        .with(telemetry)
        .with(compact)
        .with(structured)
        .with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

#[cfg(test)]
mod test {
    // This test only works when telemetry is initialized fully
    // and requires OTEL_EXPORTER_OTLP_TRACES_ENDPOINT pointing to a valid server
    #[tokio::test]
    #[ignore = "requires a trace exporter"]
    async fn get_trace_id_returns_valid_traces() {
        use super::*;
        super::init().await.unwrap();
        #[tracing::instrument(name = "test_span")] // need to be in an instrumented fn
        fn test_trace_id() -> TraceId {
            get_trace_id()
        }
        assert_ne!(test_trace_id(), TraceId::INVALID, "valid trace");
    }

    #[test]
    fn trace_id_outside_a_span_is_invalid() {
        assert_eq!(super::get_trace_id(), opentelemetry::trace::TraceId::INVALID);
    }
}
