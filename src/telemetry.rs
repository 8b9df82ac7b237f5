use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::TelemetrySettings;

/// Installs the `fmt` subscriber, plus a Jaeger exporter when an endpoint is
/// configured.
pub fn init(settings: &TelemetrySettings) -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = match &settings.jaeger_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name(&settings.service_name)
                .with_isahc() // requires `isahc_collector_client` feature
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
