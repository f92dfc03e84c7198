//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_presence_core::SweepReport;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "presence_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "presence_connections_active";
    pub const HEARTBEATS_TOTAL: &str = "presence_heartbeats_total";
    pub const SWEEP_FINALIZED_TOTAL: &str = "presence_sweep_finalized_total";
    pub const SWEEP_CONTENDED_TOTAL: &str = "presence_sweep_contended_total";
    pub const SWEEP_FAILED_TOTAL: &str = "presence_sweep_failed_total";
    pub const SNAPSHOT_REQUESTS_TOTAL: &str = "presence_snapshot_requests_total";
    pub const SNAPSHOT_LATENCY_SECONDS: &str = "presence_snapshot_latency_seconds";
    pub const ERRORS_TOTAL: &str = "presence_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of handshaken connections on this instance"
    );
    metrics::describe_counter!(names::HEARTBEATS_TOTAL, "Heartbeats written to the store");
    metrics::describe_counter!(
        names::SWEEP_FINALIZED_TOTAL,
        "Accounts finalized offline by this instance"
    );
    metrics::describe_counter!(
        names::SWEEP_CONTENDED_TOTAL,
        "Sweep candidates skipped because another instance held the lock"
    );
    metrics::describe_counter!(names::SWEEP_FAILED_TOTAL, "Sweep candidates that errored");
    metrics::describe_counter!(
        names::SNAPSHOT_REQUESTS_TOTAL,
        "Snapshot queries by result"
    );
    metrics::describe_histogram!(
        names::SNAPSHOT_LATENCY_SECONDS,
        "Snapshot query latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a heartbeat write.
pub fn record_heartbeat() {
    counter!(names::HEARTBEATS_TOTAL).increment(1);
}

/// Record the outcome of one sweep tick.
pub fn record_sweep(report: &SweepReport) {
    counter!(names::SWEEP_FINALIZED_TOTAL).increment(report.finalized.len() as u64);
    counter!(names::SWEEP_CONTENDED_TOTAL).increment(report.contended as u64);
    counter!(names::SWEEP_FAILED_TOTAL).increment(report.failed as u64);
}

/// Record a snapshot query.
pub fn record_snapshot(result: &'static str, seconds: f64) {
    counter!(names::SNAPSHOT_REQUESTS_TOTAL, "result" => result).increment(1);
    histogram!(names::SNAPSHOT_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Tracks one handshaken connection; records the disconnect on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
