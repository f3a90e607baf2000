//! [`http::HeaderMap`] adapters for OpenTelemetry propagators.
//!
//! The carriers themselves come from `opentelemetry-http`: header lookups are
//! case insensitive, values that are not visible ASCII read as absent, and
//! fields that are not valid headers are skipped on injection.
use opentelemetry::{global, Context};

pub use opentelemetry_http::{HeaderExtractor, HeaderInjector};

/// Extract a fresh context from request headers using the global propagator.
pub fn extract_headers(headers: &http::HeaderMap) -> Context {
    telemetry::propagation::extract(&HeaderExtractor(headers))
}

/// Inject `cx` into `headers` using the global propagator.
pub fn inject_headers(cx: &Context, headers: &mut http::HeaderMap) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(headers))
    });
}
