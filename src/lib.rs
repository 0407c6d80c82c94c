//! # Index Replicator
//!
//! Keeps a search index eventually consistent with a document store: a
//! resumable bulk backfill of existing rows, then live replication from the
//! store's change feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            index-replicator                               │
//! │                                                                           │
//! │  ReplicationEngine ──► CollectionReplicator (one task per collection)     │
//! │                              │                     │                      │
//! │                              ▼                     ▼                      │
//! │                      ┌───────────────┐    ┌─────────────────┐             │
//! │   PauseGate ───────► │ BackfillEngine│    │ StreamReplicator│             │
//! │   (process-wide)     │ (bulk writes) │    │ (change feed)   │             │
//! │                      └───────┬───────┘    └────────┬────────┘             │
//! │                              │                     │                      │
//! │                              ▼                     ▼                      │
//! │                      DumpProgress            ResumeToken                  │
//! │                      └──────── CheckpointStore (SQLite) ────────┘         │
//! └───────────────────────────────────────────────────────────────────────────┘
//!        ▲ SourceStore (cursor + change feed)       ▼ IndexEngine (bulk, replicate)
//! ```
//!
//! ## Recovery Rules
//!
//! | Feed exit | Action |
//! |-----------|--------|
//! | Invalidated | clear token, delete collection from index, backfill, reopen fresh |
//! | Error 40585 / 40615 | reopen fresh (no backfill) |
//! | Any other error | reopen from the persisted token, with backoff |
//! | Closed | idle (or reopen if `reopen_on_close`) |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_replicator::{ReplicationEngine, ReplicatorConfig};
//! # use index_replicator::source::SourceStore;
//! # use std::sync::Arc;
//!
//! # async fn run<S: SourceStore>(source: Arc<S>) {
//! let config = ReplicatorConfig::for_testing(&["users"]);
//! let mut engine = ReplicationEngine::dry_run(config, source);
//! engine.start().await.expect("Failed to start");
//!
//! engine.pause_backfill();
//! engine.resume_backfill();
//!
//! engine.shutdown().await;
//! # }
//! ```
//!
//! The crate installs no tracing subscriber or metrics recorder; the host
//! process does.

pub mod backfill;
pub mod bulk;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod metrics;
pub mod pause;
pub mod resilience;
pub mod source;
pub mod stream;
pub mod versioning;

// Re-exports for convenience
pub use backfill::{BackfillEngine, BackfillOutcome, BackfillReport};
pub use bulk::{BulkBatch, BulkEntry, BulkOutcome, IndexOperation};
pub use checkpoint::{CheckpointStore, DumpProgress, MemoryCheckpointStore, ResumeToken, SqliteCheckpointStore};
pub use config::{CollectionConfig, ReplicatorConfig, ReplicatorSettings, StartMode};
pub use coordinator::{CollectionPhase, CollectionReplicator, EngineState, EngineStatus, ReplicationEngine};
pub use error::{ReplicationError, Result};
pub use index::{IndexEngine, IndexError, IndexMapping, NoOpIndexEngine, VersionType};
pub use pause::PauseGate;
pub use source::{ChangeEvent, ChangeFeed, ChangeOp, Document, DocumentId, FeedEvent, FeedPosition, RowFilter, SourceError, SourceStore};
pub use stream::{FeedExit, ReplicationFailure, ReplicationFailureHook, StreamReplicator};
