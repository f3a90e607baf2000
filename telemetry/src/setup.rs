//! Installs the tracer provider, propagator and log subscriber for a process.
use crate::config::{ExporterKind, LogFormat, TelemetryConfig, RUST_LOG};
use crate::error::{TelemetryError, TelemetryResult};
use crate::propagation::ContextPropagator;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, TracerProviderBuilder};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Keeps the tracer provider alive. Call [`TelemetryGuard::shutdown`] before
/// exiting so buffered spans are exported.
#[derive(Debug)]
#[must_use = "dropping the guard does not flush buffered spans, call shutdown"]
pub struct TelemetryGuard {
    provider: SdkTracerProvider,
    propagator: ContextPropagator,
}

impl TelemetryGuard {
    /// The installed tracer provider.
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    /// The installed propagator.
    pub fn propagator(&self) -> &ContextPropagator {
        &self.propagator
    }

    /// Flush buffered spans and shut the provider down.
    pub fn shutdown(self) -> TelemetryResult<()> {
        self.provider.shutdown().map_err(|err| {
            tracing::error!(error = %err, "telemetry shutdown failed");
            TelemetryError::Shutdown(err.to_string())
        })
    }
}

/// Set up tracing and logging for this process from `config`.
///
/// Installs:
///
/// - a global tracer provider with a parent based ratio sampler, a resource
///   describing the service and the configured exporter;
/// - a [`ContextPropagator`] as the global text map propagator;
/// - a `tracing` subscriber filtered by the configured directives.
///
/// Fails if the configuration is unusable, the exporter cannot be built, or a
/// `tracing` subscriber is already installed.
pub fn init(config: &TelemetryConfig) -> TelemetryResult<TelemetryGuard> {
    init_subscriber(config)?;

    let provider = tracer_provider(config)?;
    let propagator = ContextPropagator::with_correlation_header(config.correlation_header().to_owned());

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(propagator.clone());

    tracing::info!(
        service.name = config.service_name(),
        service.version = config.service_version(),
        exporter = %config.exporter(),
        sampling_ratio = config.sampling_ratio(),
        "telemetry initialized"
    );

    Ok(TelemetryGuard {
        provider,
        propagator,
    })
}

fn resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(config.service_name().to_owned())
        .with_attributes([
            KeyValue::new(SERVICE_VERSION, config.service_version().to_owned()),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, config.environment().to_owned()),
        ])
        .build()
}

/// Build the tracer provider described by `config` without installing it.
pub fn tracer_provider(config: &TelemetryConfig) -> TelemetryResult<SdkTracerProvider> {
    let builder = SdkTracerProvider::builder()
        .with_resource(resource(config))
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.sampling_ratio(),
        ))));

    Ok(with_exporter(builder, config)?.build())
}

fn with_exporter(
    builder: TracerProviderBuilder,
    config: &TelemetryConfig,
) -> TelemetryResult<TracerProviderBuilder> {
    match config.exporter() {
        ExporterKind::None => Ok(builder),
        #[cfg(feature = "stdout")]
        ExporterKind::Stdout => {
            Ok(builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default()))
        }
        #[cfg(feature = "otlp")]
        ExporterKind::Otlp => {
            use opentelemetry_otlp::WithExportConfig;

            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(config.otlp_endpoint())
                .build()
                .map_err(|err| TelemetryError::Exporter(err.to_string()))?;
            Ok(builder.with_batch_exporter(exporter))
        }
        #[allow(unreachable_patterns)]
        other => Err(TelemetryError::config(
            crate::config::OTEL_TRACES_EXPORTER,
            format!("exporter {other} is not compiled in, enable the `{other}` feature"),
        )),
    }
}

fn init_subscriber(config: &TelemetryConfig) -> TelemetryResult<()> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::config(RUST_LOG, err.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.log_format() {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    installed.map_err(|err| TelemetryError::Subscriber(err.to_string()))
}
