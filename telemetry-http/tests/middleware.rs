use bytes::Bytes;
use futures_util::future::join;
use futures_util::FutureExt;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, TracerProvider as _};
use opentelemetry::{Context, Value};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use std::convert::Infallible;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry::correlation::current_correlation_id;
use telemetry::metrics::HttpMetrics;
use telemetry::{ContextPropagator, SpanTemplate, TracerSource};
use telemetry_http::middleware::{STATUS_CLASS_ATTRIBUTE, UNMATCHED_ROUTE};
use telemetry_http::{CorrelationLayer, MatchedRoute, RequestContext};
use tower::{service_fn, Layer, ServiceExt};

const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

struct Harness {
    exporter: InMemorySpanExporter,
    provider: SdkTracerProvider,
}

impl Harness {
    fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Harness { exporter, provider }
    }

    fn tracer(&self) -> TracerSource {
        TracerSource::from_tracer(self.provider.tracer("middleware-test"))
    }

    fn layer(&self) -> CorrelationLayer {
        CorrelationLayer::new().with_tracer(self.tracer())
    }

    fn spans(&self) -> Vec<SpanData> {
        self.provider.force_flush().unwrap();
        self.exporter.get_finished_spans().unwrap()
    }

    fn server_span(&self) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.span_kind == SpanKind::Server)
            .expect("server span")
    }
}

fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

fn ok_response(body: &'static str) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
}

#[tokio::test]
async fn request_without_headers_gets_new_trace_and_id() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|req: Request<()>| async move {
        assert!(RequestContext::from_request(&req).is_some());
        ok_response("ok")
    }));

    let response = service
        .oneshot(
            Request::get("/api/users")
                .header("user-agent", "curl/8.0")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();

    let correlation_id = response.headers()["x-request-id"].to_str().unwrap().to_owned();
    assert!(!correlation_id.is_empty());

    let span = harness.server_span();
    assert_eq!(span.name, "GET");
    assert_eq!(span.status, Status::Ok);
    assert_eq!(span.parent_span_id, opentelemetry::trace::SpanId::INVALID);
    assert_eq!(attribute(&span, "http.request.method"), Some(Value::from("GET")));
    assert_eq!(attribute(&span, "url.path"), Some(Value::from("/api/users")));
    assert_eq!(attribute(&span, "user_agent.original"), Some(Value::from("curl/8.0")));
    assert_eq!(
        attribute(&span, "correlation.id"),
        Some(Value::from(correlation_id))
    );
    assert_eq!(attribute(&span, "http.response.status_code"), Some(Value::I64(200)));
    assert_eq!(attribute(&span, STATUS_CLASS_ATTRIBUTE), Some(Value::from("ok")));
}

#[tokio::test]
async fn inbound_context_and_id_are_continued() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|req: Request<()>| async move {
        let request_context = RequestContext::from_request(&req).unwrap();
        assert_eq!(request_context.correlation_id().as_str(), "req-7");
        assert_eq!(
            request_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(
            current_correlation_id().map(|id| id.to_string()).as_deref(),
            Some("req-7")
        );
        ok_response("ok")
    }));

    let response = service
        .oneshot(
            Request::post("/orders")
                .header("traceparent", TRACEPARENT)
                .header("X-Request-ID", "req-7")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-7");

    let span = harness.server_span();
    assert_eq!(
        span.span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
    assert_eq!(span.parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[tokio::test]
async fn malformed_traceparent_starts_a_new_root() {
    let harness = Harness::new();
    let service = harness
        .layer()
        .layer(service_fn(|_req: Request<()>| async { ok_response("ok") }));

    let response = service
        .oneshot(
            Request::get("/")
                .header("traceparent", "00-not-a-trace-01")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let span = harness.server_span();
    assert_eq!(span.parent_span_id, opentelemetry::trace::SpanId::INVALID);
    assert_ne!(
        span.span_context.trace_id(),
        opentelemetry::trace::TraceId::INVALID
    );
}

#[tokio::test]
async fn configured_correlation_header_is_used() {
    let harness = Harness::new();
    let layer = CorrelationLayer::with_propagator(ContextPropagator::with_correlation_header(
        "X-Correlation-ID",
    ))
    .with_tracer(harness.tracer());
    let service = layer.layer(service_fn(|_req: Request<()>| async { ok_response("ok") }));

    let response = service
        .oneshot(
            Request::get("/")
                .header("x-correlation-id", "abc")
                .header("x-request-id", "ignored")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-correlation-id"], "abc");
    assert!(response.headers().get("x-request-id").is_none());
}

#[tokio::test]
async fn error_statuses_mark_the_span() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|req: Request<()>| async move {
        let status = if req.uri().path() == "/missing" {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = status;
        Ok::<_, Infallible>(response)
    }));

    service
        .clone()
        .oneshot(Request::get("/missing").body(()).unwrap())
        .await
        .unwrap();
    service
        .oneshot(Request::get("/down").body(()).unwrap())
        .await
        .unwrap();

    let spans = harness.spans();
    let by_path = |path: &str| {
        spans
            .iter()
            .find(|s| attribute(s, "url.path") == Some(Value::from(path.to_owned())))
            .unwrap()
    };
    let missing = by_path("/missing");
    assert_eq!(missing.status, Status::error("client error"));
    assert_eq!(
        attribute(missing, STATUS_CLASS_ATTRIBUTE),
        Some(Value::from("client_error"))
    );
    let down = by_path("/down");
    assert_eq!(down.status, Status::error("server error"));
    assert_eq!(attribute(down, "http.response.status_code"), Some(Value::I64(503)));
}

#[tokio::test]
async fn inner_service_error_is_recorded() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        Err::<Response<()>, _>(std::io::Error::new(
            std::io::ErrorKind::Other,
            "upstream closed",
        ))
    }));

    let err = service
        .oneshot(Request::get("/").body(()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "upstream closed");

    let span = harness.server_span();
    assert_eq!(span.status, Status::error("upstream closed"));
    assert!(span.events.iter().any(|event| event.name == "exception"));
}

#[tokio::test]
async fn dropped_request_is_cancelled() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        ok_response("late")
    }));

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        service.oneshot(Request::get("/slow").body(()).unwrap()),
    )
    .await;
    assert!(outcome.is_err());

    let span = harness.server_span();
    assert_eq!(span.name, "GET");
    assert_eq!(span.status, Status::error("request cancelled"));
    assert_eq!(attribute(&span, "error.type"), None);
}

#[tokio::test]
async fn panicking_handler_is_reported() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        let fail = true;
        if fail {
            panic!("handler failed");
        }
        ok_response("unreachable")
    }));

    let outcome = AssertUnwindSafe(service.oneshot(Request::get("/explode").body(()).unwrap()))
        .catch_unwind()
        .await;
    assert!(outcome.is_err());

    let span = harness.server_span();
    assert_eq!(span.status, Status::error("panicked"));
    assert_eq!(attribute(&span, "error.type"), Some(Value::from("panicked")));
}

#[tokio::test(flavor = "current_thread")]
async fn interleaved_requests_keep_their_own_context() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        let before = current_correlation_id();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let after = current_correlation_id();
        assert_eq!(before, after);
        let id = after.map(|id| id.to_string()).unwrap_or_default();
        Ok::<_, Infallible>(Response::new(id))
    }));

    let (first, second) = join(
        service
            .clone()
            .oneshot(Request::get("/a").header("x-request-id", "first").body(()).unwrap()),
        service.oneshot(Request::get("/b").header("x-request-id", "second").body(()).unwrap()),
    )
    .await;

    assert_eq!(first.unwrap().into_body(), "first");
    assert_eq!(second.unwrap().into_body(), "second");
    assert!(current_correlation_id().is_none());
}

#[tokio::test]
async fn handler_spans_are_children_of_the_server_span() {
    let harness = Harness::new();
    let query = SpanTemplate::<str>::new("load user").with_tracer(harness.tracer());
    let service = harness.layer().layer(service_fn(move |_req: Request<()>| {
        let query = query.clone();
        async move {
            let loaded = query
                .instrument("users", async {
                    assert!(Context::current().span().span_context().is_valid());
                    Ok::<_, std::fmt::Error>(())
                })
                .await;
            assert!(loaded.is_ok());
            ok_response("ok")
        }
    }));

    service
        .oneshot(Request::get("/users/1").body(()).unwrap())
        .await
        .unwrap();

    let spans = harness.spans();
    let server = spans.iter().find(|s| s.span_kind == SpanKind::Server).unwrap();
    let child = spans.iter().find(|s| s.name == "load user").unwrap();
    assert_eq!(child.parent_span_id, server.span_context.span_id());
    assert_eq!(
        child.span_context.trace_id(),
        server.span_context.trace_id()
    );
    assert_eq!(
        attribute(child, "correlation.id"),
        attribute(server, "correlation.id")
    );
}

fn order_route(parts: &http::request::Parts) -> Option<std::borrow::Cow<'static, str>> {
    parts
        .uri
        .path()
        .strip_prefix("/orders/")
        .filter(|id| id.parse::<u64>().is_ok())
        .map(|_| "/orders/{id}".into())
}

#[tokio::test]
async fn metrics_count_requests() {
    let harness = Harness::new();
    let metrics = HttpMetrics::new("orders").unwrap();
    let service = harness
        .layer()
        .with_metrics(metrics.clone())
        .with_route(order_route)
        .layer(service_fn(|_req: Request<()>| async { ok_response("ok") }));

    service
        .oneshot(Request::get("/orders/1").body(()).unwrap())
        .await
        .unwrap();

    let output = metrics.render().unwrap();
    assert!(output.contains(
        r#"http_requests_total{method="GET",route="/orders/{id}",service="orders",status="200"} 1"#
    ));
    assert!(output.contains(r#"http_requests_in_flight{method="GET",service="orders"} 0"#));

    let span = harness.server_span();
    assert_eq!(span.name, "GET /orders/{id}");
    assert_eq!(attribute(&span, "http.route"), Some(Value::from("/orders/{id}")));
    assert_eq!(attribute(&span, "url.path"), Some(Value::from("/orders/1")));
}

#[tokio::test]
async fn distinct_paths_share_one_series_per_route() {
    let harness = Harness::new();
    let metrics = HttpMetrics::new("orders").unwrap();
    let service = harness
        .layer()
        .with_metrics(metrics.clone())
        .with_route(order_route)
        .layer(service_fn(|_req: Request<()>| async { ok_response("ok") }));

    for id in 0..200 {
        service
            .clone()
            .oneshot(Request::get(format!("/orders/{id}")).body(()).unwrap())
            .await
            .unwrap();
        service
            .clone()
            .oneshot(Request::get(format!("/unknown/{id}")).body(()).unwrap())
            .await
            .unwrap();
    }
    service
        .oneshot(
            Request::builder()
                .method(Method::from_bytes(b"PURGE").unwrap())
                .uri("/orders/1")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();

    let output = metrics.render().unwrap();
    let series = output
        .lines()
        .filter(|line| line.starts_with("http_requests_total{"))
        .collect::<Vec<_>>();
    assert_eq!(series.len(), 3, "{series:?}");
    assert!(output.contains(
        r#"http_requests_total{method="GET",route="/orders/{id}",service="orders",status="200"} 200"#
    ));
    assert!(output.contains(&format!(
        r#"http_requests_total{{method="GET",route="{UNMATCHED_ROUTE}",service="orders",status="200"}} 200"#
    )));
    assert!(output.contains(
        r#"http_requests_total{method="_OTHER",route="/orders/{id}",service="orders",status="200"} 1"#
    ));

    let purge = harness
        .spans()
        .into_iter()
        .find(|span| span.name == "_OTHER /orders/{id}")
        .expect("span of the PURGE request");
    assert_eq!(
        attribute(&purge, "http.request.method_original"),
        Some(Value::from("PURGE"))
    );
}

#[tokio::test]
async fn route_matched_by_the_handler_names_the_span() {
    let harness = Harness::new();
    let metrics = HttpMetrics::new("orders").unwrap();
    let service = harness
        .layer()
        .with_metrics(metrics.clone())
        .layer(service_fn(|_req: Request<()>| async {
            let mut response = Response::new(Full::new(Bytes::new()));
            response
                .extensions_mut()
                .insert(MatchedRoute::new("/users/{id}"));
            Ok::<_, Infallible>(response)
        }));

    service
        .oneshot(Request::delete("/users/9").body(()).unwrap())
        .await
        .unwrap();

    let span = harness.server_span();
    assert_eq!(span.name, "DELETE /users/{id}");
    assert_eq!(attribute(&span, "http.route"), Some(Value::from("/users/{id}")));
    assert!(metrics.render().unwrap().contains(
        r#"http_requests_total{method="DELETE",route="/users/{id}",service="orders",status="200"} 1"#
    ));
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn handler_logs_carry_the_correlation_id() {
    let harness = Harness::new();
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        tokio::task::yield_now().await;
        tracing::info!("loading user profile");
        ok_response("ok")
    }));
    let response = service
        .oneshot(Request::get("/users/1").header("x-request-id", "req-logs").body(()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-logs");

    let trace_id = harness.server_span().span_context.trace_id().to_string();
    let line = logs
        .contents()
        .lines()
        .find(|line| line.contains("loading user profile"))
        .map(str::to_owned)
        .expect("handler log line");
    assert!(line.contains("correlation_id=req-logs"), "{line}");
    assert!(line.contains(&format!("trace_id={trace_id}")), "{line}");
}
