//! Trace-context propagation and request correlation for services.
//!
//! This crate is the protocol core shared by every service in a deployment:
//!
//! - [`propagation`]: W3C `traceparent`/`tracestate` plus a correlation header,
//!   as an OpenTelemetry [`TextMapPropagator`].
//! - [`correlation`]: the per request [`CorrelationId`] and its storage in the
//!   request's [`Context`].
//! - [`instrument`]: span templates that turn function calls into spans.
//! - [`health`]: concurrent health checks and an aggregated report.
//! - [`metrics`]: Prometheus request metrics.
//! - [`config`] and [`setup`]: environment driven bootstrap of the tracer
//!   provider, the global propagator and the log subscriber.
//!
//! The HTTP surface (header carriers, the correlation middleware and the health
//! endpoints) lives in the `telemetry-http` crate.
//!
//! # Getting started
//!
//! ```no_run
//! use telemetry::{config::TelemetryConfig, setup};
//!
//! # fn main() -> Result<(), telemetry::TelemetryError> {
//! let config = TelemetryConfig::from_env()?.with_service_name("orders");
//! let guard = setup::init(&config)?;
//!
//! // serve requests...
//!
//! guard.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`TextMapPropagator`]: opentelemetry::propagation::TextMapPropagator
//! [`Context`]: opentelemetry::Context
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod config;
pub mod correlation;
mod error;
pub mod health;
pub mod instrument;
pub mod metrics;
pub mod propagation;
pub mod setup;
pub mod trace;

pub use correlation::{CorrelationContextExt, CorrelationId};
pub use error::{TelemetryError, TelemetryResult};
pub use instrument::{ServiceTracer, SpanTemplate};
pub use propagation::ContextPropagator;
pub use trace::TracerSource;
