//! Configuration for the index replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Loading it (files, env, flags) is the host process's job.
//!
//! # Quick Start
//!
//! ```rust
//! use index_replicator::config::{CollectionConfig, ReplicatorConfig};
//!
//! let config = ReplicatorConfig {
//!     collections: vec![CollectionConfig::new("users"), CollectionConfig::new("orders")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── collections: Vec<CollectionConfig>   # One orchestrator per entry
//! ├── settings: ReplicatorSettings
//! │   ├── backfill: BackfillConfig         # Bulk dump batching, rate limit, retry
//! │   ├── stream: StreamConfig             # Change feed reopen + fire-and-forget bound
//! │   └── shutdown: ShutdownConfig
//! └── checkpoint: CheckpointConfig         # SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! collections:
//!   - name: "users"
//!   - name: "orders"
//!     start_mode: "if_incomplete"
//!
//! settings:
//!   backfill:
//!     batch_size: 1000
//!     retry_initial_delay: "1s"
//!   stream:
//!     max_in_flight_replications: 256
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/replicator/checkpoints.db"
//!   dump_progress_table: "dump_progress"
//!   resume_token_table: "resume_tokens"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Collections to replicate. Each gets an independent orchestrator.
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,

    /// Tunables for backfill and streaming.
    #[serde(default)]
    pub settings: ReplicatorSettings,

    /// Checkpoint persistence settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl ReplicatorConfig {
    /// Create a minimal config for testing (in-memory checkpoints, fast retries).
    pub fn for_testing(collections: &[&str]) -> Self {
        Self {
            collections: collections.iter().map(|c| CollectionConfig::new(c)).collect(),
            settings: ReplicatorSettings::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for collection in &self.collections {
            if collection.name.trim().is_empty() {
                return Err(ReplicationError::Config("collection name is empty".into()));
            }
            if !seen.insert(collection.name.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "collection '{}' is configured twice",
                    collection.name
                )));
            }
        }

        if self.settings.backfill.batch_size == Some(0) {
            return Err(ReplicationError::Config("backfill batch_size must be > 0".into()));
        }
        if self.settings.stream.max_in_flight_replications == 0 {
            return Err(ReplicationError::Config(
                "stream max_in_flight_replications must be > 0".into(),
            ));
        }

        for (field, value) in [
            ("backfill.retry_initial_delay", &self.settings.backfill.retry_initial_delay),
            ("backfill.retry_max_delay", &self.settings.backfill.retry_max_delay),
            ("stream.reopen_initial_delay", &self.settings.stream.reopen_initial_delay),
            ("stream.reopen_max_delay", &self.settings.stream.reopen_max_delay),
            ("shutdown.drain_timeout", &self.settings.shutdown.drain_timeout),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("{} '{}': {}", field, value, e))
            })?;
        }

        validate_table_name(&self.checkpoint.dump_progress_table)?;
        validate_table_name(&self.checkpoint.resume_token_table)?;
        if self.checkpoint.dump_progress_table == self.checkpoint.resume_token_table {
            return Err(ReplicationError::Config(
                "dump progress and resume token tables must differ".into(),
            ));
        }

        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ReplicationError::Config(format!("invalid table name '{}'", name)))
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CollectionConfig: one entry per replicated collection
// ═══════════════════════════════════════════════════════════════════════════════

/// What a collection does when its orchestrator starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Run a backfill pass, then open the change feed.
    #[default]
    Always,
    /// Backfill only if a previous pass was interrupted, or the collection
    /// has never streamed; otherwise go straight to the change feed.
    IfIncomplete,
    /// Never backfill on start (invalidation still forces a resync).
    StreamOnly,
}

/// Configuration for a single collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Source collection name; also the checkpoint key.
    pub name: String,

    #[serde(default)]
    pub start_mode: StartMode,
}

impl CollectionConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start_mode: StartMode::default(),
        }
    }

    pub fn with_start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl ReplicatorSettings {
    /// Millisecond-scale delays so tests don't sleep.
    pub fn for_testing() -> Self {
        Self {
            backfill: BackfillConfig {
                retry_initial_delay: "5ms".to_string(),
                retry_max_delay: "20ms".to_string(),
                ..Default::default()
            },
            stream: StreamConfig {
                reopen_initial_delay: "1ms".to_string(),
                reopen_max_delay: "10ms".to_string(),
                ..Default::default()
            },
            shutdown: ShutdownConfig {
                drain_timeout: "2s".to_string(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackfillConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Backfill (bulk dump) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Documents per bulk request. `None` uses the index engine's preference.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Enable rate limiting of rows read during backfill.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum rows per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// First delay before re-running a failed backfill pass (e.g. "1s").
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Ceiling for the backfill retry backoff (e.g. "5m").
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    5_000
}

fn default_rate_limit_burst() -> u32 {
    1_000
}

fn default_retry_initial_delay() -> String {
    "1s".to_string()
}

fn default_retry_max_delay() -> String {
    "5m".to_string()
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
        }
    }
}

impl BackfillConfig {
    /// Rate limit configuration, or `None` if disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            refill_rate: self.rate_limit_per_sec,
            burst_size: self.rate_limit_burst,
        })
    }

    /// Backoff schedule for re-running failed passes. Never gives up.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: parse_duration_or(&self.retry_initial_delay, Duration::from_secs(1)),
            max_delay: parse_duration_or(&self.retry_max_delay, Duration::from_secs(300)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Change feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Reopen the feed when it closes on its own. Off by default: a closed
    /// feed is logged and left alone.
    #[serde(default = "default_false")]
    pub reopen_on_close: bool,

    /// Maximum change events being applied to the index engine at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_replications: usize,

    /// First delay before reopening after consecutive feed errors.
    #[serde(default = "default_reopen_initial_delay")]
    pub reopen_initial_delay: String,

    /// Ceiling for the reopen backoff.
    #[serde(default = "default_reopen_max_delay")]
    pub reopen_max_delay: String,
}

fn default_max_in_flight() -> usize {
    256
}

fn default_reopen_initial_delay() -> String {
    "100ms".to_string()
}

fn default_reopen_max_delay() -> String {
    "30s".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reopen_on_close: false,
            max_in_flight_replications: default_max_in_flight(),
            reopen_initial_delay: default_reopen_initial_delay(),
            reopen_max_delay: default_reopen_max_delay(),
        }
    }
}

impl StreamConfig {
    /// Backoff schedule for reopening the feed after errors.
    pub fn reopen_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: parse_duration_or(&self.reopen_initial_delay, Duration::from_millis(100)),
            max_delay: parse_duration_or(&self.reopen_max_delay, Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ShutdownConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long each collection task gets to drain on shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
///
/// Dump progress and resume tokens live in two independent tables of the
/// same SQLite database, keyed by collection name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Table holding dump progress records.
    #[serde(default = "default_dump_progress_table")]
    pub dump_progress_table: String,

    /// Table holding resume token records.
    #[serde(default = "default_resume_token_table")]
    pub resume_token_table: String,
}

fn default_true() -> bool {
    true
}

fn default_dump_progress_table() -> String {
    "dump_progress".to_string()
}

fn default_resume_token_table() -> String {
    "resume_tokens".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replicator_checkpoints.db".to_string(),
            wal_mode: true,
            dump_progress_table: default_dump_progress_table(),
            resume_token_table: default_resume_token_table(),
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            ..Default::default()
        }
    }

    /// Whether this config points at a transient in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
