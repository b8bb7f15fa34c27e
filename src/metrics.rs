//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Gap detection (open gaps, closed/skipped ranges, rejected gaps)
//! - Reader throughput and timeouts
//! - Routing passes, data events and batch closes
//! - Apply-side rows, conflicts and early commits
//! - Staging store busy retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use trigger_replication::metrics;
//! use std::time::Duration;
//!
//! // After a channel pass
//! metrics::record_routing_pass("default", 1200, Duration::from_millis(85), true);
//!
//! // When the writer resolves a conflict
//! metrics::record_conflict("item", "fallback");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Gap Metrics
// =============================================================================

/// Gauge of OPEN gaps after the latest detection.
pub fn set_open_gaps(count: usize) {
    gauge!("replication_gaps_open").set(count as f64);
}

/// Record the outcome of one reconcile.
pub fn record_gap_changes(opened: usize, closed: usize, skipped: usize) {
    counter!("replication_gaps_opened_total").increment(opened as u64);
    counter!("replication_gaps_closed_total").increment(closed as u64);
    if skipped > 0 {
        counter!("replication_gaps_skipped_total").increment(skipped as u64);
    }
}

/// Record gaps dropped by validation (duplicate, reversed, suspicious size).
pub fn record_gap_rejected(reason: &str) {
    counter!("replication_gaps_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record resolved gap rows removed by the purge task.
pub fn record_gaps_purged(count: u64) {
    counter!("replication_gaps_purged_total").increment(count);
}

// =============================================================================
// Reader Metrics
// =============================================================================

/// Record rows the reader handed to the router.
pub fn record_rows_read(channel_id: &str, count: u64) {
    counter!("replication_rows_read_total", "channel_id" => channel_id.to_string()).increment(count);
}

/// Record a consumer-side take timeout.
pub fn record_reader_timeout(channel_id: &str) {
    counter!("replication_reader_timeouts_total", "channel_id" => channel_id.to_string()).increment(1);
}

/// Record rows discarded because they fell outside the active gaps.
pub fn record_rows_outside_gaps(channel_id: &str, count: u64) {
    if count > 0 {
        counter!("replication_rows_outside_gaps_total", "channel_id" => channel_id.to_string())
            .increment(count);
    }
}

// =============================================================================
// Routing Metrics
// =============================================================================

/// Record a finished channel pass.
pub fn record_routing_pass(channel_id: &str, rows: u64, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    let channel = channel_id.to_string();
    counter!("replication_routing_passes_total", "channel_id" => channel.clone(), "status" => status)
        .increment(1);
    counter!("replication_rows_routed_total", "channel_id" => channel.clone()).increment(rows);
    histogram!("replication_routing_pass_duration_seconds", "channel_id" => channel)
        .record(duration.as_secs_f64());
}

/// Record data events written in one commit.
pub fn record_data_events(channel_id: &str, count: usize) {
    counter!("replication_data_events_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record rows matched by no router (recorded against the unrouted node).
pub fn record_unrouted(channel_id: &str, count: u64) {
    if count > 0 {
        counter!("replication_rows_unrouted_total", "channel_id" => channel_id.to_string())
            .increment(count);
    }
}

/// Record an outgoing batch closing.
pub fn record_batch_closed(channel_id: &str, reason: &str, data_events: u64) {
    counter!(
        "replication_batches_closed_total",
        "channel_id" => channel_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    histogram!("replication_batch_size", "channel_id" => channel_id.to_string()).record(data_events as f64);
}

/// Record a router error by router type.
pub fn record_router_error(router_type: &str) {
    counter!("replication_router_errors_total", "router_type" => router_type.to_string()).increment(1);
}

// =============================================================================
// Apply Metrics
// =============================================================================

/// Record a row applied by the writer.
pub fn record_row_applied(event: &str) {
    counter!("replication_rows_applied_total", "event" => event.to_string()).increment(1);
}

/// Record a detected conflict and how it was resolved.
pub fn record_conflict(table: &str, resolution: &str) {
    counter!(
        "replication_conflicts_total",
        "table" => table.to_string(),
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

/// Record an early commit inside a batch.
pub fn record_early_commit() {
    counter!("replication_early_commits_total").increment(1);
}

/// Record a batch apply with its outcome.
pub fn record_batch_applied(success: bool, rows: u64, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_batches_applied_total", "status" => status).increment(1);
    histogram!("replication_batch_apply_rows").record(rows as f64);
    histogram!("replication_batch_apply_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Store and Engine Metrics
// =============================================================================

/// Record staging store retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state. Without a recorder installed these
    // are no-ops; the tests verify the calls accept edge-case inputs.

    #[test]
    fn test_gap_metrics() {
        set_open_gaps(0);
        set_open_gaps(12);
        record_gap_changes(2, 1, 0);
        record_gap_changes(0, 0, 5);
        record_gap_rejected("duplicate");
        record_gaps_purged(0);
    }

    #[test]
    fn test_reader_metrics() {
        record_rows_read("default", 100);
        record_rows_read("", 0);
        record_reader_timeout("default");
        record_rows_outside_gaps("default", 0);
        record_rows_outside_gaps("default", 3);
    }

    #[test]
    fn test_routing_metrics() {
        record_routing_pass("default", 10, Duration::from_millis(5), true);
        record_routing_pass("default", 0, Duration::ZERO, false);
        record_data_events("default", 20);
        record_unrouted("default", 1);
        record_batch_closed("default", "max_size", 1000);
        record_router_error("column");
    }

    #[test]
    fn test_apply_metrics() {
        record_row_applied("INSERT");
        record_conflict("item", "fallback");
        record_early_commit();
        record_batch_applied(true, 10, Duration::from_millis(3));
        record_batch_applied(false, 0, Duration::ZERO);
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "Unknown"] {
            set_engine_state(state);
        }
        record_store_retry("save_routing");
    }
}
