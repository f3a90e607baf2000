//! Tower middleware that gives every request a server span and a correlation ID.
//!
//! For each request [`CorrelationService`]:
//!
//! 1. extracts the remote trace context and correlation ID from the request
//!    headers, generating an ID when none was sent;
//! 2. starts a `SpanKind::Server` span named `"{METHOD} {route}"` under the
//!    remote parent, or just `"{METHOD}"` when no route is known, and stores a
//!    [`RequestContext`] in the request extensions;
//! 3. keeps the span's [`Context`] attached, and a `tracing` span carrying the
//!    correlation and trace IDs entered, whenever the inner service's future is
//!    polled;
//! 4. records the response status on the span and echoes the correlation ID in
//!    the response headers.
//!
//! A request whose future is dropped before completing ends its span with
//! `Error("request cancelled")`, or `Error("panicked")` when the inner service
//! panicked while being polled.
//!
//! Routes are never taken from the raw path: a path with IDs in it would give
//! every request its own span name and metrics series. The route comes from
//! the resolver passed to [`CorrelationLayer::with_route`], or from a
//! [`MatchedRoute`] the inner service puts in the response extensions.
//! Requests without one are counted under [`UNMATCHED_ROUTE`]. Methods outside
//! the standard set are reported as `_OTHER`.
use crate::carrier::HeaderExtractor;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{request::Parts, Method, Request, Response, StatusCode};
use opentelemetry::{
    trace::{SpanBuilder, SpanKind, Status, TraceContextExt, TraceId},
    Context, KeyValue,
};
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_REQUEST_METHOD_ORIGINAL, HTTP_RESPONSE_STATUS_CODE,
    HTTP_ROUTE, URL_PATH, USER_AGENT_ORIGINAL,
};
use pin_project_lite::pin_project;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Poll};
use telemetry::correlation::CORRELATION_ID_ATTRIBUTE;
use telemetry::metrics::{HttpMetrics, InFlightRequest};
use telemetry::{ContextPropagator, CorrelationContextExt, CorrelationId, TracerSource};
use tower::{Layer, Service};

/// Span attribute holding the response status class: `ok`, `client_error` or
/// `server_error`.
pub const STATUS_CLASS_ATTRIBUTE: &str = "http.response.status_class";

/// Metrics route label of requests no route was resolved for.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Method label of requests using a non-standard method.
pub const OTHER_METHOD: &str = "_OTHER";

const TRACER_NAME: &str = "telemetry-http";

/// The label reported for `method`: its name for standard methods,
/// [`OTHER_METHOD`] otherwise.
pub fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "HEAD" => "HEAD",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        "CONNECT" => "CONNECT",
        "OPTIONS" => "OPTIONS",
        "TRACE" => "TRACE",
        "PATCH" => "PATCH",
        _ => OTHER_METHOD,
    }
}

/// The route template a request matched, e.g. `/orders/{id}`.
///
/// A router running inside the middleware can insert it into the response
/// extensions. It takes precedence over the layer's resolver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchedRoute(pub Cow<'static, str>);

impl MatchedRoute {
    /// A matched route template.
    pub fn new(route: impl Into<Cow<'static, str>>) -> Self {
        MatchedRoute(route.into())
    }

    /// The route template.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

type RouteFn = dyn Fn(&Parts) -> Option<Cow<'static, str>> + Send + Sync;

/// Span status and class for a response status code.
///
/// Client errors are marked as errors on the server span so failed requests
/// stand out in trace views.
pub fn status_class(status: StatusCode) -> (&'static str, Status) {
    if status.is_server_error() {
        ("server_error", Status::error("server error"))
    } else if status.is_client_error() {
        ("client_error", Status::error("client error"))
    } else {
        ("ok", Status::Ok)
    }
}

/// Per request telemetry stored in the request extensions.
#[derive(Clone, Debug)]
pub struct RequestContext {
    context: Context,
    correlation_id: CorrelationId,
}

impl RequestContext {
    /// The request's context: server span plus correlation ID.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The request's correlation ID.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Trace ID of the server span.
    pub fn trace_id(&self) -> TraceId {
        self.context.span().span_context().trace_id()
    }

    /// The context stored by [`CorrelationService`], if the request went through it.
    pub fn from_request<B>(request: &Request<B>) -> Option<&RequestContext> {
        request.extensions().get::<RequestContext>()
    }
}

struct Shared {
    propagator: ContextPropagator,
    header: HeaderName,
    tracer: TracerSource,
    metrics: Option<HttpMetrics>,
    route: Option<Arc<RouteFn>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("propagator", &self.propagator)
            .field("header", &self.header)
            .field("tracer", &self.tracer)
            .field("metrics", &self.metrics)
            .field("route", &self.route.as_ref().map(|_| "<resolver>"))
            .finish()
    }
}

/// [`Layer`] producing [`CorrelationService`].
#[derive(Clone, Debug)]
pub struct CorrelationLayer {
    shared: Arc<Shared>,
}

impl Default for CorrelationLayer {
    fn default() -> Self {
        CorrelationLayer::new()
    }
}

impl CorrelationLayer {
    /// Middleware using `x-request-id` and the global tracer provider.
    pub fn new() -> Self {
        CorrelationLayer::with_propagator(ContextPropagator::new())
    }

    /// Middleware reading and writing the headers of `propagator`.
    pub fn with_propagator(propagator: ContextPropagator) -> Self {
        let header = HeaderName::from_bytes(propagator.correlation_header().as_bytes())
            .unwrap_or_else(|_| {
                tracing::warn!(
                    header = propagator.correlation_header(),
                    "invalid correlation header name, using x-request-id"
                );
                HeaderName::from_static(telemetry::correlation::DEFAULT_CORRELATION_HEADER)
            });
        CorrelationLayer {
            shared: Arc::new(Shared {
                propagator,
                header,
                tracer: TracerSource::global(TRACER_NAME),
                metrics: None,
                route: None,
            }),
        }
    }

    /// Start server spans with `tracer` instead of the global tracer provider.
    pub fn with_tracer(self, tracer: TracerSource) -> Self {
        self.map_shared(|shared| shared.tracer = tracer)
    }

    /// Record request count, latency and concurrency in `metrics`.
    pub fn with_metrics(self, metrics: HttpMetrics) -> Self {
        self.map_shared(|shared| shared.metrics = Some(metrics))
    }

    /// Resolve each request's route template, e.g. `/orders/{id}` for
    /// `/orders/42`. Return `None` for requests matching no route.
    pub fn with_route<F>(self, resolve: F) -> Self
    where
        F: Fn(&Parts) -> Option<Cow<'static, str>> + Send + Sync + 'static,
    {
        let resolve: Arc<RouteFn> = Arc::new(resolve);
        self.map_shared(|shared| shared.route = Some(resolve))
    }

    fn map_shared(self, f: impl FnOnce(&mut Shared)) -> Self {
        let mut shared = match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared,
            Err(shared) => Shared {
                propagator: shared.propagator.clone(),
                header: shared.header.clone(),
                tracer: shared.tracer.clone(),
                metrics: shared.metrics.clone(),
                route: shared.route.clone(),
            },
        };
        f(&mut shared);
        CorrelationLayer {
            shared: Arc::new(shared),
        }
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Service wrapping every request in a server span. See the [module docs](self).
#[derive(Clone, Debug)]
pub struct CorrelationService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S, B, R> Service<Request<B>> for CorrelationService<S>
where
    S: Service<Request<B>, Response = Response<R>>,
    S::Error: fmt::Display,
{
    type Response = Response<R>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let shared = &self.shared;
        let (parts, body) = request.into_parts();
        let parent = shared
            .propagator
            .extract_carrier(&HeaderExtractor(&parts.headers));
        let (parent, correlation_id) = parent.ensure_correlation_id();

        let method = method_label(&parts.method);
        let path = parts.uri.path().to_owned();
        let route = shared.route.as_ref().and_then(|resolve| resolve(&parts));

        let mut attributes = vec![
            KeyValue::new(HTTP_REQUEST_METHOD, method),
            KeyValue::new(URL_PATH, path.clone()),
            KeyValue::new(CORRELATION_ID_ATTRIBUTE, correlation_id.to_string()),
        ];
        if method == OTHER_METHOD {
            attributes.push(KeyValue::new(
                HTTP_REQUEST_METHOD_ORIGINAL,
                parts.method.as_str().to_owned(),
            ));
        }
        if let Some(route) = &route {
            attributes.push(KeyValue::new(HTTP_ROUTE, route.clone()));
        }
        if let Some(agent) = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
        {
            attributes.push(KeyValue::new(USER_AGENT_ORIGINAL, agent.to_owned()));
        }
        let mut request = Request::from_parts(parts, body);

        let builder = SpanBuilder::from_name(span_name(method, route.as_deref()))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes);
        let cx = shared.tracer.start(builder, &parent);
        let trace_id = cx.span().span_context().trace_id();

        request.extensions_mut().insert(RequestContext {
            context: cx.clone(),
            correlation_id: correlation_id.clone(),
        });

        let span = tracing::info_span!(
            "http.request",
            correlation_id = %correlation_id,
            trace_id = %trace_id,
            method = %method,
            path = %path,
        );
        let in_flight = shared.metrics.as_ref().map(|metrics| metrics.start(method));

        let inner = {
            let _attached = cx.clone().attach();
            let _entered = span.enter();
            self.inner.call(request)
        };

        ResponseFuture {
            inner,
            state: Some(RequestState {
                cx: Some(cx),
                span,
                correlation_id,
                header: shared.header.clone(),
                method,
                route,
                in_flight,
                polling: false,
            }),
        }
    }
}

pin_project! {
    /// Response future of [`CorrelationService`].
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        state: Option<RequestState>,
    }
}

impl<F> fmt::Debug for ResponseFuture<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<F, R, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<R>, E>>,
    E: fmt::Display,
{
    type Output = Result<Response<R>, E>;

    fn poll(self: Pin<&mut Self>, task: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if let Some(state) = this.state.as_mut() {
            state.polling = true;
        }
        let poll = {
            let _attached = this
                .state
                .as_ref()
                .and_then(|state| state.cx.clone())
                .map(Context::attach);
            let _entered = this.state.as_ref().map(|state| state.span.enter());
            this.inner.as_mut().poll(task)
        };
        if let Some(state) = this.state.as_mut() {
            state.polling = false;
        }
        let mut result = ready!(poll);
        if let Some(state) = this.state.take() {
            state.finish(&mut result);
        }
        Poll::Ready(result)
    }
}

struct RequestState {
    // `None` once the span has ended.
    cx: Option<Context>,
    span: tracing::Span,
    correlation_id: CorrelationId,
    header: HeaderName,
    method: &'static str,
    route: Option<Cow<'static, str>>,
    in_flight: Option<InFlightRequest>,
    // Set while the inner future is being polled, so a drop that unwinds out
    // of `poll` reads as a panic.
    polling: bool,
}

impl fmt::Debug for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestState")
            .field("correlation_id", &self.correlation_id)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl RequestState {
    fn finish<R, E: fmt::Display>(mut self, result: &mut Result<Response<R>, E>) {
        let Some(cx) = self.cx.take() else {
            return;
        };
        let span = cx.span();
        let _entered = self.span.enter();

        let status = match result {
            Ok(response) => {
                if let Some(matched) = response.extensions().get::<MatchedRoute>() {
                    span.update_name(span_name(self.method, Some(matched.as_str())));
                    span.set_attribute(KeyValue::new(HTTP_ROUTE, matched.0.clone()));
                    self.route = Some(matched.0.clone());
                }
                let status = response.status();
                let (class, span_status) = status_class(status);
                span.set_attribute(KeyValue::new(
                    HTTP_RESPONSE_STATUS_CODE,
                    i64::from(status.as_u16()),
                ));
                span.set_attribute(KeyValue::new(STATUS_CLASS_ATTRIBUTE, class));
                span.set_status(span_status);

                match HeaderValue::from_str(self.correlation_id.as_str()) {
                    Ok(value) => {
                        response.headers_mut().insert(self.header.clone(), value);
                    }
                    Err(_) => tracing::debug!("correlation id is not a valid header value"),
                }
                tracing::debug!(status = status.as_u16(), "request finished");
                status
            }
            Err(err) => {
                telemetry::instrument::record_exception(&span, &*err);
                tracing::warn!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        span.end();

        if let Some(in_flight) = self.in_flight.take() {
            let route = self.route.as_deref().unwrap_or(UNMATCHED_ROUTE);
            in_flight.finish(route, status.as_u16());
        }
    }
}

fn span_name(method: &str, route: Option<&str>) -> String {
    match route {
        Some(route) => format!("{method} {route}"),
        None => method.to_owned(),
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        if let Some(cx) = self.cx.take() {
            let span = cx.span();
            let _entered = self.span.enter();
            if self.polling || std::thread::panicking() {
                span.set_attribute(KeyValue::new(ERROR_TYPE, "panicked"));
                span.set_status(Status::error("panicked"));
                tracing::warn!("request handler panicked");
            } else {
                span.set_status(Status::error("request cancelled"));
                tracing::debug!("request cancelled before completion");
            }
            span.end();
        }
    }
}
