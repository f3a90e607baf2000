//! Liveness, readiness and metrics responses.
//!
//! These are plain functions returning [`Response`]s so they can be mounted in
//! any router. Bodies are [`Full<Bytes>`].
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::Full;
use telemetry::health::{HealthRegistry, HealthReport};
use telemetry::metrics::HttpMetrics;

const APPLICATION_JSON: &str = "application/json";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Conventional path of the liveness endpoint.
pub const LIVENESS_PATH: &str = "/health/live";
/// Conventional path of the readiness endpoint.
pub const READINESS_PATH: &str = "/health/ready";
/// Conventional path of the metrics endpoint.
pub const METRICS_PATH: &str = "/metrics";

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// `200 {"status":"alive"}`. Liveness never runs health checks.
pub fn liveness_response() -> Response<Full<Bytes>> {
    response(StatusCode::OK, APPLICATION_JSON, r#"{"status":"alive"}"#)
}

/// Run every check in `registry` and answer with the report.
pub async fn readiness_response(registry: &HealthRegistry) -> Response<Full<Bytes>> {
    report_response(&registry.check_all().await)
}

/// Serialize `report`: `200` unless the report is unhealthy, then `503`.
pub fn report_response(report: &HealthReport) -> Response<Full<Bytes>> {
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    match serde_json::to_vec(report) {
        Ok(body) => response(status, APPLICATION_JSON, body),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize health report");
            response(StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, err.to_string())
        }
    }
}

/// Render `metrics` in the Prometheus text format.
pub fn metrics_response(metrics: &HttpMetrics) -> Response<Full<Bytes>> {
    match metrics.render() {
        Ok(body) => response(StatusCode::OK, telemetry::metrics::CONTENT_TYPE, body),
        Err(err) => {
            tracing::error!(error = %err, "failed to render metrics");
            response(StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use telemetry::health::{CheckOutcome, FnCheck, HealthCheckError};

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness_is_always_alive() {
        let response = liveness_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], APPLICATION_JSON);
        assert_eq!(body_json(response).await, serde_json::json!({"status": "alive"}));
    }

    #[tokio::test]
    async fn readiness_reflects_checks() {
        let healthy = HealthRegistry::new("orders", "1.0.0").with_check(FnCheck::new("db", || async {
            Ok::<_, HealthCheckError>(CheckOutcome::pass())
        }));
        let response = readiness_response(&healthy).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "orders");
        assert_eq!(body["checks"][0]["name"], "db");

        let degraded = HealthRegistry::new("orders", "1.0.0").with_check(FnCheck::new("cache", || async {
            Ok::<_, HealthCheckError>(CheckOutcome::warn("slow"))
        }));
        assert_eq!(readiness_response(&degraded).await.status(), StatusCode::OK);

        let unhealthy = HealthRegistry::new("orders", "1.0.0").with_check(FnCheck::new("db", || async {
            Err::<CheckOutcome, _>(HealthCheckError::Failed("connection refused".to_owned()))
        }));
        let response = readiness_response(&unhealthy).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"][0]["message"], "connection refused");
    }

    #[tokio::test]
    async fn metrics_are_served_as_prometheus_text() {
        let metrics = HttpMetrics::new("orders").unwrap();
        metrics.start("GET").finish("/orders", 200);

        let response = metrics_response(&metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            telemetry::metrics::CONTENT_TYPE
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("http_requests_total"));
    }
}
