//! Prometheus metrics for Stowry.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/_stowry/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "stowry_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "stowry_http_request_duration_seconds";

/// Total service operations (counter). Labels: operation, status.
pub const SERVICE_OPERATIONS_TOTAL: &str = "stowry_service_operations_total";

/// Objects whose bytes were purged by tombstone runs (counter).
pub const OBJECTS_PURGED_TOTAL: &str = "stowry_objects_purged_total";

/// Total bytes received in upload bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "stowry_bytes_received_total";

/// Requests rejected by signature verification (counter).
pub const AUTH_FAILURES_TOTAL: &str = "stowry_auth_failures_total";

/// Path of the scrape endpoint.
pub const METRICS_PATH: &str = "/_stowry/metrics";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent, so tests may
/// call it repeatedly. Returns `None` if another recorder was already
/// installed by someone else.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe_metrics();
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install prometheus recorder");
                None
            }
        })
        .as_ref()
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(SERVICE_OPERATIONS_TOTAL, "Service operations by type and outcome");
    describe_counter!(OBJECTS_PURGED_TOTAL, "Objects purged from storage by tombstone runs");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (upload bodies)");
    describe_counter!(AUTH_FAILURES_TOTAL, "Requests rejected by signature verification");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// The scrape endpoint itself is not instrumented.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == METRICS_PATH {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Object paths are collapsed so labels stay low-cardinality:
/// - `/` -> `/`
/// - `/_stowry/health` -> `/_stowry/health`
/// - `/docs/readme.md` -> `/{path}`
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/_stowry/health" => "/_stowry/health",
        "/_stowry/metrics" => "/_stowry/metrics",
        "/_stowry/openapi.json" => "/_stowry/openapi.json",
        _ => "/{path}",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /_stowry/metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get().and_then(Option::as_ref) {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
