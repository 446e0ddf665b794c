//! Prometheus metrics for the payload servers
//!
//! Labels carry the payload mode and outcome only, never request paths.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::error::{Result, ServerError};

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_UPSTREAM_ERROR: &str = "upstream_error";

pub fn record_request(mode: &str, outcome: &str, duration: Duration) {
    counter!(
        "crossnet_requests_total",
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("crossnet_request_duration_seconds", "mode" => mode.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_request_start(mode: &str) {
    gauge!("crossnet_requests_in_flight", "mode" => mode.to_string()).increment(1.0);
}

pub fn record_request_end(mode: &str) {
    gauge!("crossnet_requests_in_flight", "mode" => mode.to_string()).decrement(1.0);
}

pub fn record_upstream(status: Option<u16>) {
    let status = status.map_or_else(|| "none".to_string(), |s| s.to_string());
    counter!("crossnet_relay_upstream_total", "status" => status).increment(1);
}

/// Install the global recorder; fails if one is already installed
pub fn init_prometheus_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))
}
