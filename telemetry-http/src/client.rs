//! Outgoing request propagation.
pub use crate::carrier::inject_headers;
use http::{request, Request};
use opentelemetry::Context;

/// Adds trace context and correlation headers to an outgoing request.
///
/// Uses the global propagator, so the headers match what [`setup::init`]
/// configured. Existing propagation headers are overwritten.
///
/// ```
/// use telemetry_http::client::PropagateExt;
///
/// let request = http::Request::get("http://inventory.internal/items")
///     .propagate()
///     .body(())
///     .unwrap();
/// # let _ = request;
/// ```
///
/// [`setup::init`]: telemetry::setup::init
pub trait PropagateExt: Sized {
    /// Propagate the current context.
    fn propagate(self) -> Self {
        Context::map_current(|cx| self.propagate_context(cx))
    }

    /// Propagate `cx`.
    fn propagate_context(self, cx: &Context) -> Self;
}

impl PropagateExt for request::Builder {
    fn propagate_context(mut self, cx: &Context) -> Self {
        if let Some(headers) = self.headers_mut() {
            inject_headers(cx, headers);
        }
        self
    }
}

impl<B> PropagateExt for Request<B> {
    fn propagate_context(mut self, cx: &Context) -> Self {
        inject_headers(cx, self.headers_mut());
        self
    }
}
