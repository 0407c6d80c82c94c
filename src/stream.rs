// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed supervision for one collection.
//!
//! [`StreamReplicator`] opens the source change feed, forwards each change
//! to the index engine and reports why the feed ended. Deciding what to do
//! next (reopen, resync, idle) is [`FeedExit::next_action`]; carrying it out
//! is the coordinator's job.
//!
//! # Feed Session
//!
//! ```text
//! watch(ignore) ──→ run_feed ──────────────→ remove_change_stream
//!   │                 │                           │
//!   │ load token      │ Changed: token = pos,     │ drop feed handle,
//!   │ (or clear it)   │   spawn replicate_one     │ persist token
//!   │                 │ Invalidated / Closed /    │
//!   ↓                 │ Errored / shutdown: exit  ↓
//! open feed           ↓                         FeedSession
//! ```
//!
//! # Resume Token
//!
//! Updated in memory on every change and written only at teardown, so an
//! unclean exit replays the changes seen since the last teardown. Replays are
//! absorbed by versioned writes at the index engine.
//!
//! # Fire-and-Forget Replication
//!
//! Changes are applied on spawned tasks; the feed loop does not wait for
//! them to complete. A [`Bulkhead`] bounds how many can be outstanding, so
//! the loop only waits when that many are still running. Completion order
//! is not guaranteed. Failures are logged, counted
//! (`replicator_replications_total{status="failure"}`) and passed to the
//! optional [`ReplicationFailureHook`].

use crate::checkpoint::{CheckpointStore, ResumeToken};
use crate::error::Result;
use crate::index::IndexEngine;
use crate::metrics;
use crate::resilience::{shutdown_signalled, Bulkhead};
use crate::source::{ChangeEvent, ChangeFeed, ChangeOp, DocumentId, FeedEvent, FeedPosition, SourceStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Resume of the change feed was not possible: the resume token was not found.
pub const RESUME_TOKEN_NOT_FOUND: i32 = 40585;

/// The resume token's collection no longer exists (dropped and recreated).
pub const RESUME_TOKEN_COLLECTION_MISSING: i32 = 40615;

/// How to reopen a feed after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRecovery {
    /// The resume position is gone; reopen from "now".
    ReopenFresh,
    /// Reopen from the last known resume position (may replay changes).
    ReopenFromToken,
}

/// Classify a feed error by its source error code.
pub fn classify_feed_error(code: Option<i32>) -> FeedRecovery {
    match code {
        Some(RESUME_TOKEN_NOT_FOUND) | Some(RESUME_TOKEN_COLLECTION_MISSING) => FeedRecovery::ReopenFresh,
        _ => FeedRecovery::ReopenFromToken,
    }
}

/// Why a feed session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedExit {
    /// The source invalidated the feed; a full resync is needed.
    Invalidated,
    /// The feed ended on its own.
    Closed,
    /// The feed failed (or could not be opened).
    Errored { code: Option<i32>, message: String },
    /// Shutdown was signalled.
    Shutdown,
}

impl FeedExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalidated => "invalidated",
            Self::Closed => "closed",
            Self::Errored { .. } => "errored",
            Self::Shutdown => "shutdown",
        }
    }

    /// Recovery step for this exit.
    pub fn next_action(&self, reopen_on_close: bool) -> StreamAction {
        match self {
            Self::Invalidated => StreamAction::Resync,
            Self::Closed if reopen_on_close => StreamAction::Reopen {
                ignore_resume_position: false,
                backoff: false,
            },
            Self::Closed => StreamAction::Idle,
            Self::Errored { code, .. } => StreamAction::Reopen {
                ignore_resume_position: classify_feed_error(*code) == FeedRecovery::ReopenFresh,
                backoff: true,
            },
            Self::Shutdown => StreamAction::Stop,
        }
    }
}

/// What the coordinator does after a feed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    /// Clear the resume token, wipe the collection from the index,
    /// backfill, then reopen fresh.
    Resync,
    /// Open the feed again.
    Reopen {
        ignore_resume_position: bool,
        /// Wait out the reopen backoff first.
        backoff: bool,
    },
    /// Leave the feed closed until shutdown.
    Idle,
    Stop,
}

/// Result of one open → consume → teardown cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSession {
    pub exit: FeedExit,
    /// Changes forwarded to the index engine during the session.
    pub applied: u64,
}

/// Details of a change the index engine failed to apply.
#[derive(Debug, Clone)]
pub struct ReplicationFailure {
    pub collection: String,
    pub document_id: DocumentId,
    pub op: ChangeOp,
    pub position: FeedPosition,
    pub error: String,
}

/// Callback invoked for every failed fire-and-forget replication.
pub type ReplicationFailureHook = Arc<dyn Fn(&ReplicationFailure) + Send + Sync>;

/// Live change feed replication for one collection.
pub struct StreamReplicator<S: SourceStore, I: IndexEngine> {
    collection: String,
    source: Arc<S>,
    index: Arc<I>,
    checkpoints: Arc<dyn CheckpointStore>,
    /// Last change position seen; persisted at teardown.
    token: Option<FeedPosition>,
    bulkhead: Bulkhead,
    failure_hook: Option<ReplicationFailureHook>,
}

impl<S: SourceStore, I: IndexEngine> StreamReplicator<S, I> {
    pub fn new(
        collection: impl Into<String>,
        source: Arc<S>,
        index: Arc<I>,
        checkpoints: Arc<dyn CheckpointStore>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            collection: collection.into(),
            source,
            index,
            checkpoints,
            token: None,
            bulkhead: Bulkhead::new(max_in_flight.max(1)),
            failure_hook: None,
        }
    }

    pub fn with_failure_hook(mut self, hook: Option<ReplicationFailureHook>) -> Self {
        self.failure_hook = hook;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// In-memory resume position (not necessarily persisted yet).
    pub fn resume_token(&self) -> Option<&FeedPosition> {
        self.token.as_ref()
    }

    /// Replications currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.bulkhead.in_flight()
    }

    /// Open the change feed.
    ///
    /// With `ignore_resume_position` the stored token is cleared and the
    /// feed starts from "now"; otherwise it resumes after the stored token.
    pub async fn watch(&mut self, ignore_resume_position: bool) -> Result<ChangeFeed> {
        if ignore_resume_position {
            self.clear_resume_token().await?;
        } else {
            self.token = self
                .checkpoints
                .get_resume_token(&self.collection)
                .await?
                .and_then(|record| record.token);
        }

        info!(
            collection = %self.collection,
            resume_from = ?self.token,
            ignore_resume_position,
            "Opening change feed"
        );

        let opened = self
            .source
            .open_change_feed(&self.collection, self.token.clone())
            .await;
        metrics::record_feed_open(&self.collection, self.token.is_some(), opened.is_ok());
        opened.map_err(|e| crate::error::ReplicationError::from_source_error("open_change_feed", e))
    }

    /// Consume `feed` until it ends, fails, is invalidated, or shutdown.
    ///
    /// Invalidation events are never forwarded to the index engine.
    pub async fn run_feed(&mut self, feed: &mut ChangeFeed, shutdown_rx: &mut watch::Receiver<bool>) -> FeedSession {
        let mut applied = 0u64;

        let exit = loop {
            if *shutdown_rx.borrow() {
                break FeedExit::Shutdown;
            }

            let event = tokio::select! {
                event = feed.next() => event,
                _ = shutdown_signalled(shutdown_rx) => break FeedExit::Shutdown,
            };

            match event {
                Some(FeedEvent::Changed(change)) => {
                    metrics::record_change_event(&self.collection, op_label(change.op));

                    // Token only advances once the change has a replication slot.
                    let permit = tokio::select! {
                        permit = self.bulkhead.acquire() => permit,
                        _ = shutdown_signalled(shutdown_rx) => break FeedExit::Shutdown,
                    };
                    match permit {
                        Ok(permit) => {
                            self.token = Some(change.position.clone());
                            self.spawn_replication(change, permit);
                            applied += 1;
                        }
                        Err(e) => {
                            error!(collection = %self.collection, error = %e, "Replication slots unavailable");
                            break FeedExit::Errored {
                                code: None,
                                message: e.to_string(),
                            };
                        }
                    }
                }
                Some(FeedEvent::Invalidated) => {
                    info!(collection = %self.collection, "Change feed invalidated");
                    break FeedExit::Invalidated;
                }
                Some(FeedEvent::Closed) | None => {
                    info!(collection = %self.collection, "Change feed closed");
                    break FeedExit::Closed;
                }
                Some(FeedEvent::Errored { code, message }) => {
                    error!(collection = %self.collection, ?code, error = %message, "Change feed error");
                    break FeedExit::Errored { code, message };
                }
            }
        };

        metrics::record_feed_exit(&self.collection, exit.as_str());
        FeedSession { exit, applied }
    }

    /// Open, consume and tear down one feed.
    ///
    /// A failure to open is reported as [`FeedExit::Errored`].
    pub async fn session(&mut self, ignore_resume_position: bool, shutdown_rx: &mut watch::Receiver<bool>) -> FeedSession {
        let mut feed = match self.watch(ignore_resume_position).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Failed to open change feed");
                let exit = FeedExit::Errored {
                    code: e.source_code(),
                    message: e.to_string(),
                };
                metrics::record_feed_exit(&self.collection, exit.as_str());
                return FeedSession { exit, applied: 0 };
            }
        };

        let session = self.run_feed(&mut feed, shutdown_rx).await;

        if let Err(e) = self.remove_change_stream(feed).await {
            error!(collection = %self.collection, error = %e, "Failed to persist resume token");
            metrics::record_error(&self.collection, "resume_token_persist");
        }
        session
    }

    /// Tear down a feed: drop the handle, then persist the resume token.
    ///
    /// This is the only place the token is written during normal streaming.
    pub async fn remove_change_stream(&mut self, feed: ChangeFeed) -> Result<()> {
        drop(feed);
        debug!(collection = %self.collection, token = ?self.token, "Change feed removed");
        self.persist_token().await
    }

    /// Forget the resume position, in memory and in the store.
    pub async fn clear_resume_token(&mut self) -> Result<()> {
        self.token = None;
        self.persist_token().await
    }

    /// Wait for every outstanding replication to finish.
    pub async fn drain(&self) {
        let in_flight = self.bulkhead.in_flight();
        if in_flight > 0 {
            info!(collection = %self.collection, in_flight, "Waiting for in-flight replications");
        }
        self.bulkhead.drain().await;
    }

    async fn persist_token(&self) -> Result<()> {
        self.checkpoints
            .put_resume_token(&self.collection, &ResumeToken::new(self.token.clone()))
            .await
    }

    fn spawn_replication(&self, change: ChangeEvent, permit: tokio::sync::OwnedSemaphorePermit) {
        let index = Arc::clone(&self.index);
        let collection = self.collection.clone();
        let hook = self.failure_hook.clone();
        let bulkhead = self.bulkhead.clone();
        metrics::set_replications_in_flight(&collection, bulkhead.in_flight());

        tokio::spawn(async move {
            let document_id = change.document_id.clone();
            let op = change.op;
            let position = change.position.clone();
            let started = Instant::now();

            let result = index.replicate_one(&collection, change).await;
            drop(permit);
            metrics::record_replication(&collection, result.is_ok(), started.elapsed());
            metrics::set_replications_in_flight(&collection, bulkhead.in_flight());

            if let Err(e) = result {
                warn!(
                    collection = %collection,
                    id = %document_id,
                    ?op,
                    error = %e,
                    "Replication failed"
                );
                if let Some(hook) = hook {
                    hook(&ReplicationFailure {
                        collection,
                        document_id,
                        op,
                        position,
                        error: e.to_string(),
                    });
                }
            }
        });
    }
}

fn op_label(op: ChangeOp) -> &'static str {
    match op {
        ChangeOp::Insert => "insert",
        ChangeOp::Update => "update",
        ChangeOp::Replace => "replace",
        ChangeOp::Delete => "delete",
    }
}
