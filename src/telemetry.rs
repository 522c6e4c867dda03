use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Config, TracerProvider as SdkTracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

/// Exporter providers that have to be flushed before the process exits.
#[derive(Default)]
pub(crate) struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Blocks until the exporters have flushed, call it off the async workers.
    pub(crate) fn shutdown(self) {
        if let Some(tracer_provider) = self.tracer_provider {
            for result in tracer_provider.force_flush() {
                if let Err(err) = result {
                    tracing::error!("Failed to flush traces: {}", err);
                }
            }
            global::shutdown_tracer_provider();
        }
        if let Some(meter_provider) = self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                tracing::error!("Failed to shut down metrics: {}", err);
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("INFO"))
}

/// Console logging only, or console plus OTLP export when an endpoint is configured.
pub(crate) fn init_telemetry(endpoint: &Option<String>, console: bool) -> Result<Telemetry> {
    let Some(endpoint) = endpoint else {
        Registry::default()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
        return Ok(Telemetry::default());
    };

    let (tracer_provider, meter_provider) = build_providers(endpoint)?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(tracer_provider.clone());
    let registry = Registry::default()
        .with(env_filter())
        .with(OpenTelemetryLayer::new(
            tracer_provider.tracer(env!("CARGO_PKG_NAME")),
        ))
        .with(MetricsLayer::new(meter_provider.clone()));

    if console {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(Telemetry {
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
    })
}

fn build_providers(endpoint: &str) -> Result<(SdkTracerProvider, SdkMeterProvider)> {
    let service_resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]);

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(build_tonic_exporter(endpoint))
        .with_trace_config(Config::default().with_resource(service_resource.clone()))
        .install_batch(runtime::Tokio)
        .context("Failed to install tracer")?;

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(build_tonic_exporter(endpoint))
        .with_resource(service_resource)
        .build()
        .context("Failed to install meter")?;

    Ok((tracer_provider, meter_provider))
}

fn build_tonic_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_timeout(Duration::from_secs(15))
        .with_endpoint(endpoint)
}
