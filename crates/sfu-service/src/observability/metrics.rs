//! Metrics definitions for the SFU.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (controller, room, session)
//! - `operation`: 8 values (one per signaling operation)
//! - `status`: success, error
//! - `error_type`: bounded by `SfuError::error_type_label`
//! - `resource`: transport, producer, consumer
//! - `reason`: bounded by `CloseReason` plus "disconnect" and "shutdown"

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling operations include engine round-trips (p99 < 250ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_operation".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set operation latency buckets: {e}"))?
        // Router creation on a fresh room
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_room_creation".to_string()),
            &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000],
        )
        .map_err(|e| format!("Failed to set room creation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Session Metrics (Gauges)
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_sessions_active").set(count as f64);
}

/// Metric: `sfu_workers_active`
///
/// Set once at startup. Workers never come back after dying (the process
/// exits), so this only changes on boot.
pub fn set_workers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling Operation Metrics
// ============================================================================

/// Record one signaling operation.
///
/// Metrics: `sfu_operations_total` (labels: `operation`, `status`),
/// `sfu_operation_duration_seconds` (labels: `operation`)
pub fn record_operation(operation: &'static str, status: &'static str, duration: Duration) {
    counter!("sfu_operations_total", "operation" => operation, "status" => status).increment(1);
    histogram!("sfu_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_operation_errors_total`
/// Labels: `operation`, `error_type`
pub fn record_operation_error(operation: &'static str, error_type: &'static str) {
    counter!(
        "sfu_operation_errors_total",
        "operation" => operation,
        "error_type" => error_type
    )
    .increment(1);
}

/// Metric: `sfu_room_creation_duration_seconds`
///
/// Time from room actor start until its router is usable.
pub fn record_room_creation(duration: Duration) {
    histogram!("sfu_room_creation_duration_seconds").record(duration.as_secs_f64());
}

/// Metric: `sfu_resources_retired_total`
/// Labels: `resource`, `reason`
pub fn record_resource_retired(resource: &'static str, reason: &'static str) {
    counter!(
        "sfu_resources_retired_total",
        "resource" => resource,
        "reason" => reason
    )
    .increment(1);
}

// ============================================================================
// Failure Metrics (Counters)
// ============================================================================

/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `sfu_worker_deaths_total`
///
/// The process exits right after this is recorded; the counter is mostly
/// useful to scrapers that caught the final exposition.
pub fn record_worker_died() {
    counter!("sfu_worker_deaths_total").increment(1);
}
