//! Errors raised while configuring and running the telemetry pipeline.
use std::borrow::Cow;

/// Errors that can occur while setting up or tearing down telemetry.
///
/// Propagation never produces one of these: malformed inbound trace fields fall
/// back to a fresh root context instead.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    /// An environment variable or builder value could not be used.
    #[error("invalid value for {variable}: {reason}")]
    Config {
        /// The variable or setting that was rejected.
        variable: Cow<'static, str>,
        /// Why it was rejected.
        reason: String,
    },

    /// The span exporter could not be built.
    #[error("failed to build span exporter: {0}")]
    Exporter(String),

    /// A metric could not be created or registered.
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    /// The global `tracing` subscriber could not be installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),

    /// The tracer provider failed to flush or shut down.
    #[error("telemetry shutdown failed: {0}")]
    Shutdown(String),
}

impl TelemetryError {
    pub(crate) fn config(variable: impl Into<Cow<'static, str>>, reason: impl Into<String>) -> Self {
        TelemetryError::Config {
            variable: variable.into(),
            reason: reason.into(),
        }
    }
}

/// Shorthand result type for fallible telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
