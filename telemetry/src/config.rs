//! Telemetry configuration.
//!
//! Values come from defaults, then environment variables, then explicit
//! `with_*` overrides. Unset or empty variables keep the default; invalid ones
//! are reported as [`TelemetryError::Config`].
use crate::correlation::DEFAULT_CORRELATION_HEADER;
use crate::error::{TelemetryError, TelemetryResult};
use std::borrow::Cow;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Name of the service.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Version of the service.
pub const TELEMETRY_SERVICE_VERSION: &str = "TELEMETRY_SERVICE_VERSION";
/// Deployment environment, e.g. `production`.
pub const TELEMETRY_ENVIRONMENT: &str = "TELEMETRY_ENVIRONMENT";
/// Span exporter: `otlp`, `stdout` or `none`.
pub const OTEL_TRACES_EXPORTER: &str = "OTEL_TRACES_EXPORTER";
/// OTLP/HTTP traces endpoint.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Ratio of new traces to sample, between 0.0 and 1.0.
pub const OTEL_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";
/// Header carrying the correlation ID.
pub const TELEMETRY_CORRELATION_HEADER: &str = "TELEMETRY_CORRELATION_HEADER";
/// Log output format: `json` or `compact`.
pub const TELEMETRY_LOG_FORMAT: &str = "TELEMETRY_LOG_FORMAT";
/// `tracing-subscriber` filter directives.
pub const RUST_LOG: &str = "RUST_LOG";

/// Default service name, as in the OpenTelemetry resource semantic conventions.
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";
/// Default deployment environment.
pub const DEFAULT_ENVIRONMENT: &str = "development";
/// Default OTLP/HTTP traces endpoint.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318/v1/traces";
/// Default log filter.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Where finished spans are sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExporterKind {
    /// OTLP over HTTP.
    Otlp,
    /// Pretty printed to stdout.
    Stdout,
    /// Spans are created and propagated but not exported.
    #[default]
    None,
}

impl FromStr for ExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otlp" => Ok(ExporterKind::Otlp),
            "stdout" | "console" => Ok(ExporterKind::Stdout),
            "none" => Ok(ExporterKind::None),
            other => Err(format!("unknown exporter {other:?}, expected otlp, stdout or none")),
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExporterKind::Otlp => "otlp",
            ExporterKind::Stdout => "stdout",
            ExporterKind::None => "none",
        })
    }
}

/// Format of log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Compact human readable lines.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" | "text" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format {other:?}, expected json or compact")),
        }
    }
}

/// Settings for [`crate::setup::init`].
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    service_name: String,
    service_version: String,
    environment: String,
    exporter: ExporterKind,
    otlp_endpoint: String,
    sampling_ratio: f64,
    correlation_header: Cow<'static, str>,
    log_format: LogFormat,
    log_filter: String,
}

impl Default for TelemetryConfig {
    /// Defaults only, the environment is not read.
    fn default() -> Self {
        TelemetryConfig {
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            service_version: env!("CARGO_PKG_VERSION").to_owned(),
            environment: DEFAULT_ENVIRONMENT.to_owned(),
            exporter: ExporterKind::default(),
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_owned(),
            sampling_ratio: 1.0,
            correlation_header: Cow::Borrowed(DEFAULT_CORRELATION_HEADER),
            log_format: LogFormat::default(),
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(name: &'static str) -> TelemetryResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|err| TelemetryError::config(name, err.to_string()))
        })
        .transpose()
}

fn check_ratio(variable: &'static str, ratio: f64) -> TelemetryResult<f64> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(TelemetryError::config(
            variable,
            format!("{ratio} is not between 0.0 and 1.0"),
        ))
    }
}

fn check_header(variable: &'static str, header: &str) -> TelemetryResult<()> {
    let valid = !header.is_empty()
        && header
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::config(
            variable,
            format!("{header:?} is not a valid header name"),
        ))
    }
}

impl TelemetryConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> TelemetryResult<Self> {
        let mut config = TelemetryConfig::default();

        if let Some(name) = var(OTEL_SERVICE_NAME) {
            config.service_name = name;
        }
        if let Some(version) = var(TELEMETRY_SERVICE_VERSION) {
            config.service_version = version;
        }
        if let Some(environment) = var(TELEMETRY_ENVIRONMENT) {
            config.environment = environment;
        }
        if let Some(exporter) = parse_var::<ExporterKind>(OTEL_TRACES_EXPORTER)? {
            config.exporter = exporter;
        }
        if let Some(endpoint) = var(OTEL_EXPORTER_OTLP_ENDPOINT) {
            config.otlp_endpoint = endpoint;
        }
        if let Some(ratio) = parse_var::<f64>(OTEL_TRACES_SAMPLER_ARG)? {
            config.sampling_ratio = check_ratio(OTEL_TRACES_SAMPLER_ARG, ratio)?;
        }
        if let Some(header) = var(TELEMETRY_CORRELATION_HEADER) {
            check_header(TELEMETRY_CORRELATION_HEADER, &header)?;
            config.correlation_header = Cow::Owned(header.to_ascii_lowercase());
        }
        if let Some(format) = parse_var::<LogFormat>(TELEMETRY_LOG_FORMAT)? {
            config.log_format = format;
        }
        if let Some(filter) = var(RUST_LOG) {
            config.log_filter = filter;
        }

        Ok(config)
    }

    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the service version.
    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Set the deployment environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the span exporter.
    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    /// Set the OTLP endpoint.
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    /// Set the ratio of new traces to sample.
    pub fn with_sampling_ratio(mut self, ratio: f64) -> TelemetryResult<Self> {
        self.sampling_ratio = check_ratio("sampling_ratio", ratio)?;
        Ok(self)
    }

    /// Set the correlation header name.
    pub fn with_correlation_header(
        mut self,
        header: impl Into<Cow<'static, str>>,
    ) -> TelemetryResult<Self> {
        let header = header.into();
        check_header("correlation_header", &header)?;
        self.correlation_header = Cow::Owned(header.to_ascii_lowercase());
        Ok(self)
    }

    /// Set the log format.
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Set the log filter directives.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Service version.
    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Deployment environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Span exporter.
    pub fn exporter(&self) -> ExporterKind {
        self.exporter
    }

    /// OTLP endpoint.
    pub fn otlp_endpoint(&self) -> &str {
        &self.otlp_endpoint
    }

    /// Ratio of new traces to sample.
    pub fn sampling_ratio(&self) -> f64 {
        self.sampling_ratio
    }

    /// Correlation header name, lowercase.
    pub fn correlation_header(&self) -> &str {
        &self.correlation_header
    }

    /// Log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Log filter directives.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }
}
