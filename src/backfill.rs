// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill: resumable bulk copy of a collection into the index.
//!
//! One pass reads every row after the checkpointed identifier, batches the
//! rows into bulk requests and checkpoints progress as the index engine
//! acknowledges them.
//!
//! # Pass Lifecycle
//!
//! ```text
//! load DumpProgress ──→ count + open cursor (id > token, or all rows)
//!        │
//!        ↓
//! ┌─→ pause gate closed? ── wait ──→ re-open cursor after token
//! │      │
//! │   batch full? ──→ await previous write, persist acknowledged progress
//! │      │            gate closed meanwhile? back to the gate
//! │      │            count += docs, spawn this write
//! │      │
//! │   next row ──→ token = row id ──→ push (descriptor, payload)
//! └──────┘
//!        │ cursor exhausted
//!        ↓
//! flush rest ──→ await ──→ reset DumpProgress to zero ("caught up")
//! ```
//!
//! # Backpressure
//!
//! At most one bulk write is outstanding per collection. The next flush
//! waits for the previous one before dispatching, and is only dispatched
//! while the pause gate is open.
//!
//! # What Gets Persisted
//!
//! The checkpoint records the position the index engine has acknowledged,
//! which trails the in-memory position by the one write in flight. A bulk
//! write that fails is therefore never skipped on the next pass.
//!
//! # Errors
//!
//! - Row-read error: logged, ends the pass early ([`BackfillOutcome::Truncated`]).
//!   Rows already read are flushed and progress persisted, not reset.
//! - Bulk write error: returned to the caller. Progress stays at the last
//!   acknowledged batch.

use crate::bulk::{BulkBatch, BulkOutcome, IndexOperation};
use crate::checkpoint::{CheckpointStore, DumpProgress};
use crate::error::{ReplicationError, Result};
use crate::index::{IndexEngine, IndexMapping, IndexResult};
use crate::metrics;
use crate::pause::PauseGate;
use crate::resilience::{shutdown_signalled, RateLimiter};
use crate::source::{DocumentId, DocumentStream, RowFilter, SourceStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a backfill pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Cursor exhausted; progress reset to zero.
    Completed,
    /// A row-read error ended the pass early; progress kept for resume.
    Truncated,
    /// Shutdown was signalled; acknowledged progress kept for resume.
    Interrupted,
}

impl BackfillOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Truncated => "truncated",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Summary of one backfill pass.
#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub outcome: BackfillOutcome,
    /// Documents indexed by the end of the pass, including any carried over
    /// from an interrupted earlier pass.
    pub processed: u64,
    /// Estimated total (rows remaining at start + carried-over count).
    pub total: u64,
    /// Bulk requests acknowledged during this pass.
    pub batches: usize,
    /// Rows skipped because they had no identifier.
    pub skipped: u64,
    pub elapsed: Duration,
}

impl BackfillReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == BackfillOutcome::Completed
    }
}

/// A bulk write that has been dispatched but not yet awaited.
struct InFlightWrite {
    handle: JoinHandle<IndexResult<BulkOutcome>>,
    docs: usize,
    /// Progress to persist once this write is acknowledged.
    snapshot: DumpProgress,
    started: Instant,
}

/// Per-pass mutable state.
struct PassState {
    progress: DumpProgress,
    persisted: DumpProgress,
    in_flight: Option<InFlightWrite>,
    batch: BulkBatch,
    total: u64,
    initial_count: u64,
    batches: usize,
    skipped: u64,
    started: Instant,
}

/// Drives backfill passes for one collection.
pub struct BackfillEngine<S: SourceStore, I: IndexEngine> {
    collection: String,
    source: Arc<S>,
    index: Arc<I>,
    checkpoints: Arc<dyn CheckpointStore>,
    pause: Arc<PauseGate>,
    mapping: IndexMapping,
    batch_size: usize,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl<S: SourceStore, I: IndexEngine> BackfillEngine<S, I> {
    /// Create an engine for `collection`.
    ///
    /// `batch_size` is the number of documents per bulk request; `None`
    /// uses the index engine's preference. Zero is treated as one.
    pub fn new(
        collection: impl Into<String>,
        source: Arc<S>,
        index: Arc<I>,
        checkpoints: Arc<dyn CheckpointStore>,
        pause: Arc<PauseGate>,
        mapping: IndexMapping,
        batch_size: Option<usize>,
    ) -> Self {
        let batch_size = batch_size.unwrap_or_else(|| index.preferred_batch_size()).max(1);
        Self {
            collection: collection.into(),
            source,
            index,
            checkpoints,
            pause,
            mapping,
            batch_size,
            rate_limiter: None,
        }
    }

    /// Throttle rows read with a (possibly shared) rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Documents per bulk request.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    /// Run one backfill pass.
    ///
    /// Returns `Err` only for source count/open failures, bulk write
    /// failures and checkpoint failures; the caller decides whether to retry.
    pub async fn run_backfill(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<BackfillReport> {
        let progress = self
            .checkpoints
            .get_dump_progress(&self.collection)
            .await?
            .unwrap_or_default();

        let filter = progress.resume_filter();
        let remaining = self
            .source
            .count_matching(&self.collection, &filter)
            .await
            .map_err(|e| ReplicationError::from_source_error("count_matching", e))?;

        let mut state = PassState {
            total: remaining + progress.count,
            initial_count: progress.count,
            persisted: progress.clone(),
            progress,
            in_flight: None,
            batch: BulkBatch::new(self.collection.clone()),
            batches: 0,
            skipped: 0,
            started: Instant::now(),
        };

        info!(
            collection = %self.collection,
            resume_count = state.initial_count,
            resume_token = ?state.progress.token,
            total = state.total,
            batch_size = self.batch_size,
            "Starting backfill pass"
        );
        metrics::set_backfill_progress(&self.collection, state.progress.count, state.total);

        let mut cursor = self.open_cursor(&filter).await?;

        let outcome = loop {
            if *shutdown_rx.borrow() {
                break BackfillOutcome::Interrupted;
            }

            if self.pause.is_paused() {
                info!(collection = %self.collection, "Backfill waiting on pause gate");
                tokio::select! {
                    _ = self.pause.wait_until_open() => {}
                    _ = shutdown_signalled(&mut shutdown_rx) => break BackfillOutcome::Interrupted,
                }
                // The old cursor may not survive an arbitrary pause.
                let filter = RowFilter::resume_from(state.progress.token.as_ref());
                cursor = self.open_cursor(&filter).await?;
                info!(
                    collection = %self.collection,
                    resume_token = ?state.progress.token,
                    "Backfill resumed, cursor re-opened"
                );
            }

            if state.batch.is_full(self.batch_size) {
                self.settle_in_flight(&mut state).await?;
                // A pause that closed while the previous write drained holds this one.
                if self.pause.is_paused() {
                    continue;
                }
                self.flush(&mut state).await?;
            }

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let next = tokio::select! {
                next = cursor.next() => next,
                _ = shutdown_signalled(&mut shutdown_rx) => break BackfillOutcome::Interrupted,
            };

            let mut doc = match next {
                None => break BackfillOutcome::Completed,
                Some(Err(e)) => {
                    warn!(
                        collection = %self.collection,
                        error = %e,
                        token = ?state.progress.token,
                        "Row read failed, ending backfill pass early"
                    );
                    metrics::record_error(&self.collection, "row_read");
                    break BackfillOutcome::Truncated;
                }
                Some(Ok(doc)) => doc,
            };
            metrics::record_backfill_rows_read(&self.collection, 1);

            let Some(id) = doc.remove(&self.mapping.id_field).map(DocumentId) else {
                warn!(
                    collection = %self.collection,
                    id_field = %self.mapping.id_field,
                    "Row has no identifier, skipping"
                );
                metrics::record_backfill_row_skipped(&self.collection);
                state.skipped += 1;
                continue;
            };

            state.progress.token = Some(id.clone());
            let op = IndexOperation::for_document(&self.mapping, &id, &doc);
            state.batch.push(op, doc);
        };

        match outcome {
            BackfillOutcome::Completed | BackfillOutcome::Truncated => {
                state.progress.count += state.batch.doc_count() as u64;
                self.settle_in_flight(&mut state).await?;
                if !state.batch.is_empty() {
                    let snapshot = state.progress.clone();
                    state.in_flight = Some(self.dispatch(state.batch.take(), snapshot));
                    self.settle_in_flight(&mut state).await?;
                }
                self.log_throughput(&state);
            }
            BackfillOutcome::Interrupted => {
                info!(
                    collection = %self.collection,
                    pending_docs = state.batch.doc_count(),
                    "Shutdown during backfill, draining in-flight write"
                );
                self.settle_in_flight(&mut state).await?;
            }
        }

        // Only acknowledged batches have been counted at this point.
        let processed = state.progress.count;
        if outcome == BackfillOutcome::Completed {
            state.progress.reset();
            self.persist(&mut state.persisted, &state.progress).await?;
        }

        let report = BackfillReport {
            outcome,
            processed,
            total: state.total,
            batches: state.batches,
            skipped: state.skipped,
            elapsed: state.started.elapsed(),
        };
        metrics::record_backfill_pass(&self.collection, outcome.as_str(), report.elapsed);

        info!(
            collection = %self.collection,
            outcome = outcome.as_str(),
            batches = report.batches,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Backfill pass finished"
        );
        Ok(report)
    }

    async fn open_cursor(&self, filter: &RowFilter) -> Result<DocumentStream> {
        self.source
            .find_matching(&self.collection, filter)
            .await
            .map_err(|e| ReplicationError::from_source_error("find_matching", e))
    }

    /// Full batch: count it, wait for the previous write, dispatch this one.
    async fn flush(&self, state: &mut PassState) -> Result<()> {
        state.progress.count += state.batch.doc_count() as u64;
        self.settle_in_flight(state).await?;

        let snapshot = state.progress.clone();
        state.in_flight = Some(self.dispatch(state.batch.take(), snapshot));
        self.log_throughput(state);
        Ok(())
    }

    fn dispatch(&self, batch: BulkBatch, snapshot: DumpProgress) -> InFlightWrite {
        let docs = batch.doc_count();
        debug!(collection = %self.collection, docs, "Dispatching bulk write");
        let index = Arc::clone(&self.index);
        let handle = tokio::spawn(async move { index.bulk_write(batch).await });
        InFlightWrite {
            handle,
            docs,
            snapshot,
            started: Instant::now(),
        }
    }

    /// Await the outstanding write, if any, and persist what it acknowledged.
    async fn settle_in_flight(&self, state: &mut PassState) -> Result<()> {
        let Some(write) = state.in_flight.take() else {
            return Ok(());
        };

        let result = match write.handle.await {
            Ok(result) => result.map_err(|e| ReplicationError::from_index_error("bulk_write", e)),
            Err(e) => Err(ReplicationError::Internal(format!("bulk write task failed: {}", e))),
        };
        metrics::record_backfill_batch(&self.collection, write.docs, write.started.elapsed(), result.is_ok());

        let outcome = result?;
        if !outcome.is_success() {
            warn!(
                collection = %self.collection,
                failed = outcome.failed,
                indexed = outcome.indexed,
                "Index engine rejected documents in bulk write"
            );
            metrics::record_error(&self.collection, "bulk_item");
        }
        if outcome.version_conflicts > 0 {
            debug!(
                collection = %self.collection,
                version_conflicts = outcome.version_conflicts,
                "Skipped documents already at a newer version"
            );
        }

        state.batches += 1;
        self.persist(&mut state.persisted, &write.snapshot).await
    }

    /// Write `progress` unless it is what was last written.
    async fn persist(&self, persisted: &mut DumpProgress, progress: &DumpProgress) -> Result<()> {
        if persisted == progress {
            return Ok(());
        }
        self.checkpoints.put_dump_progress(&self.collection, progress).await?;
        *persisted = progress.clone();
        Ok(())
    }

    fn log_throughput(&self, state: &PassState) {
        let elapsed = state.started.elapsed().as_secs_f64();
        let this_pass = state.progress.count.saturating_sub(state.initial_count);
        let docs_per_sec = if elapsed > 0.0 { this_pass as f64 / elapsed } else { 0.0 };
        info!(
            collection = %self.collection,
            processed = state.progress.count,
            total = state.total,
            docs_per_sec = docs_per_sec.round() as u64,
            "Backfill progress"
        );
        metrics::set_backfill_progress(&self.collection, state.progress.count, state.total);
    }
}
