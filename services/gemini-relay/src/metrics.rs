//! Prometheus metrics exposition
//!
//! - `relay_requests_total` (counter): labels `status`, `type`
//! - `relay_request_duration_seconds` (histogram): label `status`
//! - `relay_upstream_errors_total` (counter): label `error_type`
//! - `relay_upstream_retries_total` (counter, emitted by the retry loop)
//! - `relay_quota_rejections_total` (counter): label `reason`
//! - `relay_quota_usage` (gauge): labels `window`, `unit`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use quota::QuotaSnapshot;

/// Bucket boundaries from 5ms to 120s. Backoff alone can add 31s on top of
/// the upstream's own latency.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("relay_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed relay request.
pub fn record_request(status: u16, kind: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone(), "type" => kind.to_string())
        .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a classified upstream failure.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_quota_rejection(reason: &str) {
    metrics::counter!("relay_quota_rejections_total", "reason" => reason.to_string())
        .increment(1);
}

/// Publish the current window counters as gauges.
pub fn set_quota_usage(snapshot: &QuotaSnapshot) {
    metrics::gauge!("relay_quota_usage", "window" => "minute", "unit" => "requests")
        .set(snapshot.minute_requests as f64);
    metrics::gauge!("relay_quota_usage", "window" => "minute", "unit" => "tokens")
        .set(snapshot.minute_tokens as f64);
    metrics::gauge!("relay_quota_usage", "window" => "day", "unit" => "requests")
        .set(snapshot.daily_requests as f64);
    metrics::gauge!("relay_quota_usage", "window" => "day", "unit" => "tokens")
        .set(snapshot.daily_tokens as f64);
}
