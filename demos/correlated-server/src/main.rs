//! An order lookup service showing correlated traces and logs.
//!
//! ```text
//! OTEL_SERVICE_NAME=orders OTEL_TRACES_EXPORTER=stdout cargo run -p correlated-server
//! curl -H 'x-request-id: demo-1' localhost:3000/orders/1
//! curl localhost:3000/health/ready
//! ```
use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry::config::TelemetryConfig;
use telemetry::health::{DiskCheck, HealthRegistry, MemoryCheck};
use telemetry::instrument::operations;
use telemetry::metrics::HttpMetrics;
use telemetry::{setup, ServiceTracer, SpanTemplate};
use telemetry_http::endpoints::{self, LIVENESS_PATH, METRICS_PATH, READINESS_PATH};
use telemetry_http::{CorrelationLayer, RequestContext};
use tokio::net::TcpListener;
use tower::Layer;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone, Debug, Serialize)]
struct Order {
    id: u64,
    item: &'static str,
    quantity: u32,
}

#[derive(Debug, thiserror::Error)]
enum OrderError {
    #[error("order {0} not found")]
    NotFound(u64),
}

#[derive(Clone)]
struct OrderService {
    orders: Arc<HashMap<u64, Order>>,
    find: SpanTemplate<u64>,
    select: SpanTemplate<u64>,
}

impl OrderService {
    fn new() -> Self {
        let orders = [
            Order { id: 1, item: "keyboard", quantity: 2 },
            Order { id: 2, item: "monitor", quantity: 1 },
        ];
        OrderService {
            orders: Arc::new(orders.into_iter().map(|order| (order.id, order)).collect()),
            find: ServiceTracer::new("OrderService").operation("find"),
            select: operations::db("SELECT", "orders"),
        }
    }

    async fn find(&self, id: u64) -> Result<Order, OrderError> {
        self.find
            .instrument(&id, async {
                self.select
                    .instrument(&id, async {
                        tracing::info!(order.id = id, "loading order");
                        self.orders.get(&id).cloned().ok_or(OrderError::NotFound(id))
                    })
                    .await
            })
            .record_result()
            .await
    }
}

#[derive(Clone)]
struct App {
    orders: OrderService,
    health: Arc<HealthRegistry>,
    metrics: HttpMetrics,
}

impl App {
    async fn route(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let request = RequestContext::from_request(&req).cloned();
        drop(req);

        let response = match (method, path.as_str()) {
            (Method::GET, LIVENESS_PATH) => endpoints::liveness_response(),
            (Method::GET, READINESS_PATH) => endpoints::readiness_response(&self.health).await,
            (Method::GET, METRICS_PATH) => endpoints::metrics_response(&self.metrics),
            (Method::GET, path) if path.starts_with("/orders/") => {
                match path["/orders/".len()..].parse::<u64>() {
                    Ok(id) => self.order(id, request).await,
                    Err(_) => status(StatusCode::BAD_REQUEST, "order id must be a number"),
                }
            }
            _ => status(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    async fn order(&self, id: u64, request: Option<RequestContext>) -> Response<Full<Bytes>> {
        if let Some(request) = request {
            tracing::debug!(
                correlation_id = %request.correlation_id(),
                trace_id = %request.trace_id(),
                "looking up order"
            );
        }
        match self.orders.find(id).await {
            Ok(order) => match serde_json::to_vec(&order) {
                Ok(body) => json(StatusCode::OK, body),
                Err(err) => status(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
            },
            Err(err) => status(StatusCode::NOT_FOUND, &err.to_string()),
        }
    }
}

fn route_template(parts: &http::request::Parts) -> Option<Cow<'static, str>> {
    match parts.uri.path() {
        path @ (LIVENESS_PATH | READINESS_PATH | METRICS_PATH) => Some(Cow::Owned(path.to_owned())),
        path if path.starts_with("/orders/") => Some(Cow::Borrowed("/orders/{id}")),
        _ => None,
    }
}

fn json(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn status(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(
        status,
        serde_json::json!({ "error": message }).to_string().into_bytes(),
    )
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = TelemetryConfig::from_env()?;
    let telemetry = setup::init(&config)?;

    let metrics = HttpMetrics::new(config.service_name())?;
    let health = HealthRegistry::new(config.service_name(), config.service_version())
        .with_check(MemoryCheck::default())
        .with_check(DiskCheck::new("/"));
    let app = App {
        orders: OrderService::new(),
        health: Arc::new(health),
        metrics: metrics.clone(),
    };

    let service = CorrelationLayer::with_propagator(telemetry.propagator().clone())
        .with_metrics(metrics)
        .with_route(route_template)
        .layer(tower::service_fn(move |req: Request<Incoming>| {
            let app = app.clone();
            async move { app.route(req).await }
        }));

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let service = TowerToHyperService::new(service.clone());
                tokio::spawn(async move {
                    if let Err(err) = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::warn!(%peer, error = %err, "connection failed");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("shutting down");
    telemetry.shutdown()?;
    Ok(())
}
