// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-collection orchestration: backfill, then stream, recovering forever.
//!
//! A [`CollectionReplicator`] owns one [`BackfillEngine`] and one
//! [`StreamReplicator`] and runs until shutdown:
//!
//! 1. Optional initial backfill (per [`StartMode`]), retried with backoff
//!    until a pass completes
//! 2. Feed sessions, each followed by the recovery step from
//!    [`FeedExit::next_action`](crate::stream::FeedExit::next_action):
//!    - invalidated: clear token, wipe the index and dump progress, full
//!      backfill, reopen fresh
//!    - resume token lost (40585/40615): reopen fresh, no backfill
//!    - other error: reopen from the persisted token after backoff
//!    - closed: idle (or reopen if configured)
//! 3. On shutdown: drain outstanding replications, publish `Stopped`
//!
//! Nothing here ends the task early on error; failures are logged, counted
//! and retried.

use super::types::CollectionPhase;
use crate::backfill::{BackfillEngine, BackfillOutcome};
use crate::checkpoint::{CheckpointStore, DumpProgress};
use crate::config::{CollectionConfig, ReplicatorSettings, StartMode};
use crate::error::{ReplicationError, Result};
use crate::index::{IndexEngine, IndexMapping};
use crate::metrics;
use crate::pause::PauseGate;
use crate::resilience::{shutdown_signalled, sleep_or_shutdown, RateLimiter, RetryConfig};
use crate::source::SourceStore;
use crate::stream::{FeedExit, ReplicationFailureHook, StreamAction, StreamReplicator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

/// Replication orchestrator for a single collection.
pub struct CollectionReplicator<S: SourceStore, I: IndexEngine> {
    name: String,
    start_mode: StartMode,
    index: Arc<I>,
    checkpoints: Arc<dyn CheckpointStore>,
    backfill: BackfillEngine<S, I>,
    stream: StreamReplicator<S, I>,
    backfill_retry: RetryConfig,
    reopen_retry: RetryConfig,
    reopen_on_close: bool,
    phase_tx: watch::Sender<CollectionPhase>,
}

impl<S: SourceStore, I: IndexEngine> CollectionReplicator<S, I> {
    /// Register the collection's schema with the index engine and build
    /// the backfill and stream components from the returned mapping.
    pub async fn new(
        config: &CollectionConfig,
        settings: &ReplicatorSettings,
        source: Arc<S>,
        index: Arc<I>,
        checkpoints: Arc<dyn CheckpointStore>,
        pause: Arc<PauseGate>,
    ) -> Result<Self> {
        let mapping: IndexMapping = index
            .register_schema(&config.name)
            .await
            .map_err(|e| ReplicationError::from_index_error("register_schema", e))?;

        info!(
            collection = %config.name,
            index = %mapping.index,
            doc_type = %mapping.doc_type,
            version_type = %mapping.version_type,
            "Schema registered"
        );

        let backfill = BackfillEngine::new(
            config.name.clone(),
            Arc::clone(&source),
            Arc::clone(&index),
            Arc::clone(&checkpoints),
            pause,
            mapping,
            settings.backfill.batch_size,
        );
        let stream = StreamReplicator::new(
            config.name.clone(),
            source,
            Arc::clone(&index),
            Arc::clone(&checkpoints),
            settings.stream.max_in_flight_replications,
        );
        let (phase_tx, _) = watch::channel(CollectionPhase::Idle);

        Ok(Self {
            name: config.name.clone(),
            start_mode: config.start_mode,
            index,
            checkpoints,
            backfill,
            stream,
            backfill_retry: settings.backfill.retry_config(),
            reopen_retry: settings.stream.reopen_retry_config(),
            reopen_on_close: settings.stream.reopen_on_close,
            phase_tx,
        })
    }

    /// Throttle backfill reads.
    pub fn with_rate_limiter(mut self, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        self.backfill = self.backfill.with_rate_limiter(rate_limiter);
        self
    }

    /// Observe failed replications.
    pub fn with_failure_hook(mut self, hook: Option<ReplicationFailureHook>) -> Self {
        self.stream = self.stream.with_failure_hook(hook);
        self
    }

    /// Publish phases on a channel created before this replicator existed.
    pub(crate) fn with_phase_sender(mut self, phase_tx: watch::Sender<CollectionPhase>) -> Self {
        self.phase_tx = phase_tx;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> CollectionPhase {
        *self.phase_tx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<CollectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn backfill_engine(&self) -> &BackfillEngine<S, I> {
        &self.backfill
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(collection = %self.name, start_mode = ?self.start_mode, "Collection replicator starting");

        match self.should_backfill_on_start().await {
            Ok(true) => {
                self.set_phase(CollectionPhase::Backfilling);
                if !self.backfill_until_complete(&mut shutdown_rx).await {
                    self.finish().await;
                    return;
                }
            }
            Ok(false) => info!(collection = %self.name, "Skipping initial backfill"),
            Err(e) => {
                // Checkpoint store unreadable; backfilling is the safe default.
                warn!(collection = %self.name, error = %e, "Could not read checkpoints, backfilling");
                self.set_phase(CollectionPhase::Backfilling);
                if !self.backfill_until_complete(&mut shutdown_rx).await {
                    self.finish().await;
                    return;
                }
            }
        }

        let mut ignore_resume_position = false;
        let mut reopen_attempt = 0usize;

        loop {
            self.set_phase(CollectionPhase::Streaming);
            let session = self
                .stream
                .session(ignore_resume_position, &mut shutdown_rx)
                .instrument(info_span!("change_stream", ignore_resume_position))
                .await;
            if session.applied > 0 {
                reopen_attempt = 0;
            }

            match session.exit.next_action(self.reopen_on_close) {
                StreamAction::Stop => break,
                StreamAction::Resync => {
                    if !self.resync(&mut shutdown_rx).await {
                        break;
                    }
                    ignore_resume_position = true;
                    reopen_attempt = 0;
                }
                StreamAction::Reopen {
                    ignore_resume_position: ignore,
                    backoff,
                } => {
                    if ignore {
                        // Changes between the lost token and the reopen are not replicated.
                        warn!(
                            collection = %self.name,
                            exit = ?session.exit,
                            "Resume token lost, reopening change feed from now"
                        );
                        if let FeedExit::Errored { code: Some(code), .. } = &session.exit {
                            metrics::record_resume_gap(&self.name, *code);
                        }
                    }
                    ignore_resume_position = ignore;

                    if backoff {
                        reopen_attempt += 1;
                        let delay = self.reopen_retry.delay_for_attempt(reopen_attempt);
                        info!(
                            collection = %self.name,
                            attempt = reopen_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Reopening change feed after backoff"
                        );
                        if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
                StreamAction::Idle => {
                    self.set_phase(CollectionPhase::Idle);
                    info!(collection = %self.name, "Change feed left closed until shutdown");
                    shutdown_signalled(&mut shutdown_rx).await;
                    break;
                }
            }
        }

        self.finish().await;
    }

    async fn should_backfill_on_start(&self) -> Result<bool> {
        match self.start_mode {
            StartMode::Always => Ok(true),
            StartMode::StreamOnly => Ok(false),
            StartMode::IfIncomplete => {
                let progress = self.checkpoints.get_dump_progress(&self.name).await?;
                if progress.is_some_and(|p| p.is_in_progress()) {
                    return Ok(true);
                }
                let token = self.checkpoints.get_resume_token(&self.name).await?;
                Ok(token.is_none())
            }
        }
    }

    /// Invalidation recovery. Returns `false` if shutdown interrupted it.
    async fn resync(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        self.set_phase(CollectionPhase::Resyncing);
        metrics::record_resync(&self.name);
        info!(collection = %self.name, "Resyncing collection after invalidation");

        if let Err(e) = self.stream.clear_resume_token().await {
            error!(collection = %self.name, error = %e, "Failed to clear resume token");
            metrics::record_error(&self.name, "resume_token_persist");
        }

        let mut attempt = 0usize;
        loop {
            if *shutdown_rx.borrow() {
                return false;
            }
            match self.wipe().await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    let delay = self.backfill_retry.delay_for_attempt(attempt);
                    error!(
                        collection = %self.name,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to wipe collection before resync, retrying"
                    );
                    metrics::record_error(&self.name, "delete_all");
                    if !sleep_or_shutdown(delay, shutdown_rx).await {
                        return false;
                    }
                }
            }
        }

        self.backfill_until_complete(shutdown_rx).await
    }

    /// Delete the collection from the index and drop any half-finished pass,
    /// so the next backfill starts from the first row.
    async fn wipe(&self) -> Result<()> {
        self.index
            .delete_all_for(&self.name)
            .await
            .map_err(|e| ReplicationError::from_index_error("delete_all_for", e))?;
        self.checkpoints
            .put_dump_progress(&self.name, &DumpProgress::default())
            .await
    }

    /// Run backfill passes until one completes. Returns `false` on shutdown.
    async fn backfill_until_complete(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0usize;

        loop {
            let pass = self
                .backfill
                .run_backfill(shutdown_rx.clone())
                .instrument(info_span!("backfill", attempt))
                .await;
            match pass {
                Ok(report) => match report.outcome {
                    BackfillOutcome::Completed => {
                        info!(
                            collection = %self.name,
                            processed = report.processed,
                            skipped = report.skipped,
                            "Backfill complete"
                        );
                        return true;
                    }
                    BackfillOutcome::Interrupted => return false,
                    BackfillOutcome::Truncated => {
                        warn!(
                            collection = %self.name,
                            processed = report.processed,
                            "Backfill pass ended early, resuming from checkpoint"
                        );
                    }
                },
                Err(e) => {
                    error!(
                        collection = %self.name,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Backfill failed"
                    );
                    metrics::record_error(&self.name, "backfill");
                }
            }

            attempt += 1;
            if !self.backfill_retry.allows_attempt(attempt) {
                error!(collection = %self.name, attempt, "Backfill retries exhausted");
                return false;
            }
            metrics::record_backfill_retry(&self.name);
            let delay = self.backfill_retry.delay_for_attempt(attempt);
            if !sleep_or_shutdown(delay, shutdown_rx).await {
                return false;
            }
        }
    }

    async fn finish(&self) {
        self.stream.drain().await;
        self.set_phase(CollectionPhase::Stopped);
        info!(collection = %self.name, "Collection replicator stopped");
    }

    fn set_phase(&self, phase: CollectionPhase) {
        self.phase_tx.send_replace(phase);
        metrics::set_collection_phase(&self.name, &phase.to_string());
    }
}
