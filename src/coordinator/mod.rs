// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - One [`CollectionReplicator`] task per configured collection
//! - The process-wide backfill [`PauseGate`]
//!
//! # Architecture
//!
//! The coordinator manages the full replication lifecycle:
//! 1. Opens the checkpoint store (SQLite unless one is injected)
//! 2. Registers every collection's schema with the index engine
//! 3. Spawns one independent task per collection; a collection whose
//!    registration failed keeps retrying it inside its own task
//! 4. Handles graceful shutdown, draining each task with a timeout
//!
//! Collections share nothing but the pause gate, the optional backfill rate
//! limiter and the collaborators themselves; a failure in one never stops
//! another.

mod collection;
mod types;

pub use collection::CollectionReplicator;
pub use types::{CollectionPhase, CollectionStatus, EngineState, EngineStatus};

use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use crate::config::{CollectionConfig, ReplicatorConfig, ReplicatorSettings};
use crate::error::{ReplicationError, Result};
use crate::index::{IndexEngine, NoOpIndexEngine};
use crate::metrics;
use crate::pause::PauseGate;
use crate::resilience::{sleep_or_shutdown, RateLimiter};
use crate::source::SourceStore;
use crate::stream::ReplicationFailureHook;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A spawned collection task and its phase channel.
struct CollectionHandle {
    name: String,
    phase_rx: watch::Receiver<CollectionPhase>,
    task: tokio::task::JoinHandle<()>,
}

/// What a collection needs to (re)try construction.
struct PendingCollection<S: SourceStore, I: IndexEngine> {
    config: CollectionConfig,
    settings: ReplicatorSettings,
    source: Arc<S>,
    index: Arc<I>,
    checkpoints: Arc<dyn CheckpointStore>,
    pause: Arc<PauseGate>,
    rate_limiter: Option<Arc<RateLimiter>>,
    failure_hook: Option<ReplicationFailureHook>,
}

impl<S: SourceStore, I: IndexEngine> PendingCollection<S, I> {
    async fn build(&self) -> Result<CollectionReplicator<S, I>> {
        Ok(CollectionReplicator::new(
            &self.config,
            &self.settings,
            Arc::clone(&self.source),
            Arc::clone(&self.index),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.pause),
        )
        .await?
        .with_rate_limiter(self.rate_limiter.clone())
        .with_failure_hook(self.failure_hook.clone()))
    }

    /// Retry registration on the backfill backoff, then replicate.
    async fn register_then_run(self, phase_tx: watch::Sender<CollectionPhase>, mut shutdown_rx: watch::Receiver<bool>) {
        let retry = self.settings.backfill.retry_config();
        let mut attempt = 0usize;

        while retry.allows_attempt(attempt) {
            attempt += 1;
            if !sleep_or_shutdown(retry.delay_for_attempt(attempt), &mut shutdown_rx).await {
                break;
            }
            match self.build().await {
                Ok(replicator) => {
                    replicator.with_phase_sender(phase_tx).run(shutdown_rx).await;
                    return;
                }
                Err(e) => {
                    warn!(collection = %self.config.name, error = %e, attempt, "Schema registration failed, retrying");
                    metrics::record_error(&self.config.name, "register_schema");
                }
            }
        }

        phase_tx.send_replace(CollectionPhase::Stopped);
        metrics::set_collection_phase(&self.config.name, &CollectionPhase::Stopped.to_string());
    }
}

/// The main replication engine.
///
/// Keeps a set of source collections replicated into the index engine.
///
/// # Collaborators
///
/// The host process passes in the source store and index engine. The
/// engine only **reads** from the source and only **writes** to the index;
/// checkpoints go to the configured [`CheckpointStore`].
pub struct ReplicationEngine<S: SourceStore, I: IndexEngine = NoOpIndexEngine> {
    config: ReplicatorConfig,

    source: Arc<S>,

    index: Arc<I>,

    /// Injected store; if `None`, a SQLite store is opened at start.
    checkpoints: Option<Arc<dyn CheckpointStore>>,

    /// The SQLite store this engine opened (closed on shutdown).
    sqlite_store: Option<Arc<SqliteCheckpointStore>>,

    /// Shared by every collection's backfill
    pause: Arc<PauseGate>,

    failure_hook: Option<ReplicationFailureHook>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    collections: RwLock<Vec<CollectionHandle>>,
}

impl<S: SourceStore> ReplicationEngine<S, NoOpIndexEngine> {
    /// Engine that reads the source but writes nothing (dry run).
    pub fn dry_run(config: ReplicatorConfig, source: Arc<S>) -> Self {
        Self::new(config, source, Arc::new(NoOpIndexEngine::default()))
    }
}

impl<S: SourceStore, I: IndexEngine> ReplicationEngine<S, I> {
    /// Create an engine in the `Created` state.
    ///
    /// Call [`start()`](Self::start) to begin replication.
    pub fn new(config: ReplicatorConfig, source: Arc<S>, index: Arc<I>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            source,
            index,
            checkpoints: None,
            sqlite_store: None,
            pause: Arc::new(PauseGate::new()),
            failure_hook: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            collections: RwLock::new(Vec::new()),
        }
    }

    /// Use `store` instead of opening the configured SQLite database.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Share an existing pause gate (e.g. one wired to an admin endpoint).
    pub fn with_pause_gate(mut self, pause: Arc<PauseGate>) -> Self {
        self.pause = pause;
        self
    }

    /// Observe every failed fire-and-forget replication.
    pub fn with_failure_hook(mut self, hook: ReplicationFailureHook) -> Self {
        self.failure_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn index_engine(&self) -> &Arc<I> {
        &self.index
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Pause all backfills at their next row. Returns `false` if already paused.
    ///
    /// Change feeds keep running.
    pub fn pause_backfill(&self) -> bool {
        self.pause.pause()
    }

    /// Resume all paused backfills. Returns `false` if not paused.
    pub fn resume_backfill(&self) -> bool {
        self.pause.resume()
    }

    pub fn is_backfill_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.pause
    }

    /// Snapshot of engine state, pause state and every collection's phase.
    pub async fn status(&self) -> EngineStatus {
        let collections = self
            .collections
            .read()
            .await
            .iter()
            .map(|c| CollectionStatus {
                name: c.name.clone(),
                phase: *c.phase_rx.borrow(),
            })
            .collect();

        EngineStatus {
            state: self.state(),
            backfill_paused: self.pause.is_paused(),
            collections,
        }
    }

    /// Phase receiver for one collection, once started.
    pub async fn collection_phase(&self, name: &str) -> Option<watch::Receiver<CollectionPhase>> {
        self.collections
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.phase_rx.clone())
    }

    /// Start the replication engine.
    ///
    /// 1. Validates config
    /// 2. Opens the checkpoint store (unless injected)
    /// 3. Registers each collection's schema with the index engine
    /// 4. Spawns one replicator task per collection
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(collections = self.config.collections.len(), "Starting replication engine");
        self.set_state(EngineState::Starting);

        match self.start_collections().await {
            Ok(count) => {
                self.set_state(EngineState::Running);
                metrics::set_active_collections(count);
                info!(collections = count, "Replication engine running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Replication engine failed to start");
                let _ = self.shutdown_tx.send(true);
                self.join_collections().await;
                self.close_store().await;
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn start_collections(&mut self) -> Result<usize> {
        self.config.validate()?;

        let checkpoints = match &self.checkpoints {
            Some(store) => Arc::clone(store),
            None => {
                let store = Arc::new(SqliteCheckpointStore::from_config(&self.config.checkpoint).await?);
                info!(path = %store.path(), "Checkpoint store initialized");
                self.sqlite_store = Some(Arc::clone(&store));
                let store: Arc<dyn CheckpointStore> = store;
                self.checkpoints = Some(Arc::clone(&store));
                store
            }
        };

        // One limiter shared by every collection's backfill
        let rate_limiter: Option<Arc<RateLimiter>> = self.config.settings.backfill.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for backfill"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        // Register every schema before spawning anything.
        let mut built = Vec::with_capacity(self.config.collections.len());
        for collection in &self.config.collections {
            let pending = PendingCollection {
                config: collection.clone(),
                settings: self.config.settings.clone(),
                source: Arc::clone(&self.source),
                index: Arc::clone(&self.index),
                checkpoints: Arc::clone(&checkpoints),
                pause: Arc::clone(&self.pause),
                rate_limiter: rate_limiter.clone(),
                failure_hook: self.failure_hook.clone(),
            };
            let replicator = pending.build().await;
            built.push((pending, replicator));
        }

        let mut handles = self.collections.write().await;
        for (pending, replicator) in built {
            let name = pending.config.name.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let span = info_span!("collection", collection = %name);

            let (phase_rx, task) = match replicator {
                Ok(replicator) => {
                    let phase_rx = replicator.phase_receiver();
                    (phase_rx, tokio::spawn(replicator.run(shutdown_rx).instrument(span)))
                }
                Err(e) => {
                    error!(collection = %name, error = %e, "Schema registration failed, retrying in background");
                    metrics::record_error(&name, "register_schema");
                    let (phase_tx, phase_rx) = watch::channel(CollectionPhase::Idle);
                    let task = tokio::spawn(pending.register_then_run(phase_tx, shutdown_rx).instrument(span));
                    (phase_rx, task)
                }
            };
            debug!(collection = %name, "Spawned collection replicator");
            handles.push(CollectionHandle { name, phase_rx, task });
        }

        Ok(handles.len())
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal every collection task to stop
    /// 2. Wait for each to drain (in-flight bulk write, replications,
    ///    resume token teardown), up to `shutdown.drain_timeout`
    /// 3. Checkpoint and close the SQLite store, if this engine opened it
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        self.join_collections().await;
        self.close_store().await;

        metrics::set_active_collections(0);
        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }

    async fn join_collections(&self) {
        let handles: Vec<_> = {
            let mut guard = self.collections.write().await;
            std::mem::take(&mut *guard)
        };

        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for collection tasks to drain");
        }

        let drain_timeout = self.config.settings.shutdown.drain_timeout_duration();
        for mut handle in handles {
            match tokio::time::timeout(drain_timeout, &mut handle.task).await {
                Ok(Ok(())) => {
                    debug!(collection = %handle.name, "Collection task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(collection = %handle.name, error = %e, "Collection task panicked during shutdown");
                }
                Err(_) => {
                    // Must not outlive the checkpoint store closed next.
                    handle.task.abort();
                    warn!(
                        collection = %handle.name,
                        "Collection task timed out during shutdown, aborted (progress since last checkpoint will be redone)"
                    );
                }
            }
        }
    }

    async fn close_store(&mut self) {
        if let Some(store) = self.sqlite_store.take() {
            store.close().await;
        }
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }
}
