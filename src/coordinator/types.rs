//! Engine and collection state types.
//!
//! # Engine State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (schemas registered, tasks spawned)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(store failure)──→ Failed
//! ```
//!
//! # Collection Phases
//!
//! ```text
//! Idle ──→ Backfilling ──→ Streaming ──(invalidated)──→ Resyncing ──→ Streaming
//!                              │
//!                              ├──(closed, no reopen)──→ Idle
//!                              └──(shutdown)──→ Stopped
//! ```

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Opening the checkpoint store and registering collection schemas.
    Starting,

    /// Collection tasks are running.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight bulk writes and replications are being drained and
    /// checkpoints persisted. Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start. Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What one collection's replicator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionPhase {
    /// Not started yet, or feed closed and left closed.
    Idle,
    /// Initial backfill pass (including retries).
    Backfilling,
    /// Change feed open (or being reopened).
    Streaming,
    /// Invalidation recovery: wipe, backfill, reopen.
    Resyncing,
    /// Task finished.
    Stopped,
}

impl std::fmt::Display for CollectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionPhase::Idle => write!(f, "Idle"),
            CollectionPhase::Backfilling => write!(f, "Backfilling"),
            CollectionPhase::Streaming => write!(f, "Streaming"),
            CollectionPhase::Resyncing => write!(f, "Resyncing"),
            CollectionPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of one collection, from [`ReplicationEngine::status`](super::ReplicationEngine::status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStatus {
    pub name: String,
    pub phase: CollectionPhase,
}

/// Snapshot of the whole engine.
///
/// Collected from watch channels only; no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub backfill_paused: bool,
    pub collections: Vec<CollectionStatus>,
}

impl EngineStatus {
    /// Collections currently in `phase`.
    pub fn count_in(&self, phase: CollectionPhase) -> usize {
        self.collections.iter().filter(|c| c.phase == phase).count()
    }
}
