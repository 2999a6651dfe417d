use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static RECORDER_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide `metrics` recorder once and return its handle.
///
/// Safe to call repeatedly (tests build many routers in one process).
pub fn install_recorder() -> &'static PrometheusHandle {
    RECORDER_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("A metrics recorder was already installed");
        }
        handle
    })
}

/// Render the HTTP metrics collected by [`metrics_middleware`].
pub fn render() -> String {
    RECORDER_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    // Route template keeps label cardinality bounded (`/admin/plans/:name`).
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method),
        ("path", path),
        ("status", status),
    ];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());

    response
}
