//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `key_pool_size` (gauge): keys the rotator cycles through
//! - `key_provisioning_attempts_total` (counter): label `outcome`

use std::time::Duration;

use axum::http::{Method, StatusCode};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets (5ms to 60s) so it
/// renders as a histogram with `_bucket` lines instead of a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Upstream failure classes for `proxy_upstream_errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamError {
    Timeout,
    Connection,
    Body,
}

impl UpstreamError {
    pub fn label(self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Connection => "connection",
            UpstreamError::Body => "body",
        }
    }
}

/// Record a finished proxy request.
pub fn record_request(status: StatusCode, method: &Method, elapsed: Duration) {
    let status = status.as_u16().to_string();
    metrics::counter!(
        "proxy_requests_total",
        "status" => status.clone(),
        "method" => method.as_str().to_owned()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status)
        .record(elapsed.as_secs_f64());
}

pub fn record_upstream_error(kind: UpstreamError) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => kind.label()).increment(1);
}

pub fn set_pool_size(size: usize) {
    metrics::gauge!("key_pool_size").set(size as f64);
}

/// Record one provisioning run: `success`, `retry` or `fatal`.
pub fn record_provisioning_attempt(outcome: &'static str) {
    metrics::counter!("key_provisioning_attempts_total", "outcome" => outcome).increment(1);
}
