//! HTTP request metrics in Prometheus format.
use crate::error::TelemetryResult;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::fmt;
use std::time::{Duration, Instant};

/// Content type of [`HttpMetrics::render`] output.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

const REQUEST_LABELS: &[&str] = &["method", "route", "status", "service"];
const IN_FLIGHT_LABELS: &[&str] = &["method", "service"];
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Labels of one finished request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabels {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Route template or path, e.g. `/users/{id}`.
    pub route: String,
    /// Response status code.
    pub status: u16,
    /// Service name.
    pub service: String,
}

/// Request count, latency and concurrency for an HTTP service.
///
/// Cloning is cheap and clones record into the same metrics.
#[derive(Clone)]
pub struct HttpMetrics {
    registry: Registry,
    service: String,
    requests: IntCounterVec,
    duration: HistogramVec,
    in_flight: IntGaugeVec,
}

impl fmt::Debug for HttpMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMetrics")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl HttpMetrics {
    /// Create the metrics in a new registry.
    pub fn new(service: impl Into<String>) -> TelemetryResult<Self> {
        HttpMetrics::with_registry(Registry::new(), service)
    }

    /// Create the metrics and register them in `registry`.
    ///
    /// Fails if metrics with the same names are already registered.
    pub fn with_registry(registry: Registry, service: impl Into<String>) -> TelemetryResult<Self> {
        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            REQUEST_LABELS,
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            REQUEST_LABELS,
        )?;
        let in_flight = IntGaugeVec::new(
            Opts::new(
                "http_requests_in_flight",
                "Number of HTTP requests currently being served",
            ),
            IN_FLIGHT_LABELS,
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(HttpMetrics {
            registry,
            service: service.into(),
            requests,
            duration,
            in_flight,
        })
    }

    /// The registry holding these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Service name recorded in the `service` label.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn start(&self, method: &str) -> InFlightRequest {
        let gauge = self
            .in_flight
            .with_label_values(&[method, self.service.as_str()]);
        gauge.inc();
        InFlightRequest {
            metrics: self.clone(),
            method: method.to_owned(),
            started: Instant::now(),
            gauge,
        }
    }

    /// Record a finished request.
    pub fn observe(&self, labels: &MetricLabels, duration: Duration) {
        let status = labels.status.to_string();
        let values = [
            labels.method.as_str(),
            labels.route.as_str(),
            status.as_str(),
            labels.service.as_str(),
        ];
        self.requests.with_label_values(&values).inc();
        self.duration
            .with_label_values(&values)
            .observe(duration.as_secs_f64());
    }

    /// Encode every metric in the registry in the Prometheus text format.
    pub fn render(&self) -> TelemetryResult<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

/// A request counted by the in-flight gauge.
pub struct InFlightRequest {
    metrics: HttpMetrics,
    method: String,
    started: Instant,
    gauge: IntGauge,
}

impl InFlightRequest {
    /// Record the request as finished with `status`, served by `route`.
    pub fn finish(self, route: &str, status: u16) {
        let labels = MetricLabels {
            method: self.method.clone(),
            route: route.to_owned(),
            status,
            service: self.metrics.service.clone(),
        };
        self.metrics.observe(&labels, self.started.elapsed());
    }
}

impl fmt::Debug for InFlightRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRequest")
            .field("method", &self.method)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
