//! Metrics tracking middleware
//!
//! Tracks request latency, counts and status codes, plus authentication
//! events, in a Prometheus registry rendered by `GET /metrics`.
//!
//! Author: hephaex@gmail.com

use axum::{extract::Request, middleware::Next, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    static ref HTTP_REQUESTS: IntCounterVec = register(IntCounterVec::new(
        Opts::new("storegate_http_requests_total", "HTTP requests by endpoint and status"),
        &["method", "endpoint", "status"],
    ));

    static ref HTTP_DURATION: HistogramVec = register(HistogramVec::new(
        HistogramOpts::new(
            "storegate_http_request_duration_seconds",
            "HTTP request latency",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "endpoint"],
    ));

    static ref AUTH_EVENTS: IntCounterVec = register(IntCounterVec::new(
        Opts::new("storegate_auth_events_total", "Authentication events by kind"),
        &["event"],
    ));

    static ref ACTIVE_SESSIONS: IntGauge = register(IntGauge::new(
        "storegate_active_sessions",
        "Active refresh sessions at the last maintenance pass",
    ));
}

fn register<C>(collector: prometheus::Result<C>) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    // Metric names and labels are static; construction cannot fail
    let collector = collector.expect("valid metric definition");
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "Metric already registered");
    }
    collector
}

/// Count an authentication event (login_success, login_failure, refresh, ...)
pub fn record_auth_event(event: &str) {
    AUTH_EVENTS.with_label_values(&[event]).inc();
}

pub fn set_active_sessions(count: u64) {
    ACTIVE_SESSIONS.set(count.min(i64::MAX as u64) as i64);
}

/// Render the registry in Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Metrics tracking middleware
///
/// Records:
/// - Request count per endpoint and status
/// - Request latency distribution
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = normalize_endpoint(request.uri().path());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[&method, &endpoint, &status])
        .inc();
    HTTP_DURATION
        .with_label_values(&[&method, &endpoint])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Normalize endpoint paths for consistent metrics
///
/// Replaces UUID/ID segments with placeholders to group similar endpoints.
/// Verification tokens in `verify-email/:token` are collapsed as well.
pub fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let normalized: Vec<String> = segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            if is_uuid(seg) || is_numeric(seg) {
                ":id".to_string()
            } else if i > 0 && segments[i - 1] == "verify-email" {
                ":token".to_string()
            } else {
                (*seg).to_string()
            }
        })
        .collect();

    normalized.join("/")
}

/// Check if a string looks like a UUID
pub fn is_uuid(s: &str) -> bool {
    s.len() == 36
        && s.chars().enumerate().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Check if a string is numeric (likely an ID)
fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
