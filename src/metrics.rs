//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Backfill throughput and progress
//! - Change feed events, exits and reopens
//! - Fire-and-forget replication outcomes
//! - Checkpoint persistence
//! - Engine and per-collection state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Installing a recorder/exporter is the host process's job; without one
//! these calls are no-ops.
//!
//! # Usage
//!
//! ```rust,no_run
//! use index_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the backfill after a bulk request is acknowledged
//! metrics::record_backfill_batch("users", 500, Duration::from_millis(80), true);
//!
//! // In the stream replicator for each applied change
//! metrics::record_change_event("users", "update");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Backfill
// =============================================================================

/// Record one bulk request finishing.
pub fn record_backfill_batch(collection: &str, docs: usize, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replicator_backfill_batches_total",
        "collection" => collection.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!("replicator_backfill_documents_indexed_total", "collection" => collection.to_string())
            .increment(docs as u64);
    }
    histogram!("replicator_backfill_batch_size", "collection" => collection.to_string()).record(docs as f64);
    histogram!("replicator_backfill_batch_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record rows pulled from the source cursor.
pub fn record_backfill_rows_read(collection: &str, count: usize) {
    counter!("replicator_backfill_rows_read_total", "collection" => collection.to_string()).increment(count as u64);
}

/// Record a row skipped because it had no identifier.
pub fn record_backfill_row_skipped(collection: &str) {
    counter!("replicator_backfill_rows_skipped_total", "collection" => collection.to_string()).increment(1);
}

/// Progress gauges for the current pass.
pub fn set_backfill_progress(collection: &str, count: u64, total: u64) {
    gauge!("replicator_backfill_progress_count", "collection" => collection.to_string()).set(count as f64);
    gauge!("replicator_backfill_progress_total", "collection" => collection.to_string()).set(total as f64);
}

/// Record how a backfill pass ended (completed, truncated, interrupted, failed).
pub fn record_backfill_pass(collection: &str, outcome: &str, duration: Duration) {
    counter!(
        "replicator_backfill_passes_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("replicator_backfill_pass_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed pass being retried after backoff.
pub fn record_backfill_retry(collection: &str) {
    counter!("replicator_backfill_retries_total", "collection" => collection.to_string()).increment(1);
}

/// Gauge for the process-wide backfill pause (1 = paused).
pub fn set_backfill_paused(paused: bool) {
    gauge!("replicator_backfill_paused").set(if paused { 1.0 } else { 0.0 });
}

// =============================================================================
// Change feed
// =============================================================================

/// Record a change event received from the feed.
pub fn record_change_event(collection: &str, op: &str) {
    counter!(
        "replicator_change_events_total",
        "collection" => collection.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record the outcome of one fire-and-forget replication.
pub fn record_replication(collection: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replicator_replications_total",
        "collection" => collection.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replicator_replication_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for replications currently outstanding.
pub fn set_replications_in_flight(collection: &str, in_flight: usize) {
    gauge!("replicator_replications_in_flight", "collection" => collection.to_string()).set(in_flight as f64);
}

/// Record why a feed session ended (invalidated, closed, errored, shutdown).
pub fn record_feed_exit(collection: &str, reason: &str) {
    counter!(
        "replicator_feed_exits_total",
        "collection" => collection.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a feed being (re)opened.
pub fn record_feed_open(collection: &str, from_token: bool, success: bool) {
    let status = if success { "success" } else { "failure" };
    let resume = if from_token { "token" } else { "now" };
    counter!(
        "replicator_feed_opens_total",
        "collection" => collection.to_string(),
        "resume" => resume,
        "status" => status
    )
    .increment(1);
}

/// Record a full resync (invalidation).
pub fn record_resync(collection: &str) {
    counter!("replicator_resyncs_total", "collection" => collection.to_string()).increment(1);
}

/// Record a feed restarted from "now" after its token was lost.
///
/// Changes between the lost token and the restart are not replicated.
pub fn record_resume_gap(collection: &str, code: i32) {
    counter!(
        "replicator_resume_gaps_total",
        "collection" => collection.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Record a checkpoint write (`kind` is dump_progress or resume_token).
pub fn record_checkpoint_write(collection: &str, kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replicator_checkpoint_writes_total",
        "collection" => collection.to_string(),
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_retry(operation: &str) {
    counter!("replicator_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// State
// =============================================================================

/// Record errors by type.
pub fn record_error(collection: &str, error_type: &str) {
    counter!(
        "replicator_errors_total",
        "collection" => collection.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for a collection's phase.
pub fn set_collection_phase(collection: &str, phase: &str) {
    let value = match phase {
        "Idle" => 0.0,
        "Backfilling" => 1.0,
        "Streaming" => 2.0,
        "Resyncing" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("replicator_collection_phase", "collection" => collection.to_string()).set(value);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_engine_state").set(value);
}

/// Gauge for number of collections with a live task.
pub fn set_active_collections(count: usize) {
    gauge!("replicator_active_collections").set(count as f64);
}
