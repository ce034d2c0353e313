//! Prometheus metrics for the node service.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: total number of node RPCs by operation and status
    pub const NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: duration of node RPCs in seconds
    pub const NODE_OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a node RPC with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::NODE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::NODE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}
