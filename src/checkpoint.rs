// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for backfill progress and change feed positions.
//!
//! Two independent record kinds, both keyed by collection name:
//!
//! - [`DumpProgress`]: how far the current backfill pass got
//!   (`count` documents indexed, `token` = last identifier read).
//!   Written at least once per flushed batch and reset to zero when a
//!   pass completes.
//! - [`ResumeToken`]: the last change feed position applied to the index.
//!   Kept in memory while a feed is open and written only when the feed is
//!   torn down.
//!
//! # Stores
//!
//! - [`SqliteCheckpointStore`]: durable, one table per record kind
//!   (WAL mode, upserts, retry on `SQLITE_BUSY`/`SQLITE_LOCKED`).
//! - [`MemoryCheckpointStore`]: process-local, for tests and dry runs.
//!
//! ## Resume Semantics
//!
//! ```text
//! backfill: read row 1234 → token = 1234 → flush → persist {count, 1234}
//!           (crash before persist = re-read rows after the previous token)
//! feed:     event e → token = e → ... → teardown → persist e
//!           (crash before teardown = replay events since the last teardown)
//! ```
//!
//! Both replays are harmless because index writes are versioned.

use crate::config::{validate_table_name, CheckpointConfig};
use crate::error::{ReplicationError, Result};
use crate::source::{DocumentId, FeedPosition, RowFilter};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Type alias for boxed checkpoint futures.
pub type CheckpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Backfill progress for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpProgress {
    /// Documents already indexed in the current pass.
    pub count: u64,
    /// Last source identifier read; the next cursor starts after it.
    pub token: Option<DocumentId>,
}

impl DumpProgress {
    /// True if a pass was started and not completed.
    pub fn is_in_progress(&self) -> bool {
        self.count > 0
    }

    /// Cursor filter for resuming: after `token` if a pass is in progress,
    /// otherwise every row.
    pub fn resume_filter(&self) -> RowFilter {
        if self.is_in_progress() {
            RowFilter::resume_from(self.token.as_ref())
        } else {
            RowFilter::All
        }
    }

    /// Back to the zero state ("caught up").
    pub fn reset(&mut self) {
        self.count = 0;
        self.token = None;
    }
}

/// Change feed resume position for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    /// `None` when no live change has been applied yet, or after invalidation.
    pub token: Option<FeedPosition>,
}

impl ResumeToken {
    pub fn new(token: Option<FeedPosition>) -> Self {
        Self { token }
    }

    pub fn is_absent(&self) -> bool {
        self.token.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Upsertable key-by-collection persistence for both record kinds.
///
/// The two keyspaces are independent: writing one never touches the other.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Load dump progress, or `None` if never written.
    fn get_dump_progress(&self, collection: &str) -> CheckpointFuture<'_, Option<DumpProgress>>;

    /// Upsert dump progress.
    fn put_dump_progress(&self, collection: &str, progress: &DumpProgress) -> CheckpointFuture<'_, ()>;

    /// Load the resume token record, or `None` if never written.
    fn get_resume_token(&self, collection: &str) -> CheckpointFuture<'_, Option<ResumeToken>>;

    /// Upsert the resume token record.
    fn put_resume_token(&self, collection: &str, token: &ResumeToken) -> CheckpointFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn encode_token<T: Serialize>(token: &Option<T>) -> Result<Option<String>> {
    token
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(ReplicationError::from)
}

fn decode_token<T: for<'de> Deserialize<'de>>(raw: Option<String>) -> Result<Option<T>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(ReplicationError::from)
}

/// Durable checkpoint storage backed by SQLite.
pub struct SqliteCheckpointStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Table for [`DumpProgress`] records
    dump_table: String,
    /// Table for [`ResumeToken`] records
    resume_table: String,
    /// Path to database file
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) a store at `path` with the default table names.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = CheckpointConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Open a store as described by `config`.
    ///
    /// Creates the database and both tables if they don't exist.
    pub async fn from_config(config: &CheckpointConfig) -> Result<Self> {
        validate_table_name(&config.dump_progress_table)?;
        validate_table_name(&config.resume_token_table)?;

        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, "Initializing checkpoint store");

        let journal_mode = if config.wal_mode && !config.is_in_memory() {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Memory
        };

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A pooled in-memory database is per-connection, so pin it to one.
        let max_connections = if config.is_in_memory() { 1 } else { 2 };
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if config.is_in_memory() {
            pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                collection TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                token TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
            config.dump_progress_table
        ))
        .execute(&pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                collection TEXT PRIMARY KEY,
                token TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
            config.resume_token_table
        ))
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            dump_table: config.dump_progress_table.clone(),
            resume_table: config.resume_token_table.clone(),
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All collections with a stored dump progress record (for diagnostics).
    pub async fn collections_with_progress(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT collection FROM {} ORDER BY collection", self.dump_table))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get_dump_progress(&self, collection: &str) -> CheckpointFuture<'_, Option<DumpProgress>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let sql = format!("SELECT count, token FROM {} WHERE collection = ?", self.dump_table);
            let row: Option<(i64, Option<String>)> = sqlx::query_as(&sql)
                .bind(&collection)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some((count, token)) => Ok(Some(DumpProgress {
                    count: u64::try_from(count).unwrap_or(0),
                    token: decode_token(token)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn put_dump_progress(&self, collection: &str, progress: &DumpProgress) -> CheckpointFuture<'_, ()> {
        let collection = collection.to_string();
        let progress = progress.clone();
        Box::pin(async move {
            let token = encode_token(&progress.token)?;
            let count = i64::try_from(progress.count).unwrap_or(i64::MAX);
            let now = chrono::Utc::now().timestamp_millis();
            let sql = format!(
                r#"
                INSERT INTO {} (collection, count, token, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(collection) DO UPDATE SET
                    count = excluded.count,
                    token = excluded.token,
                    updated_at = excluded.updated_at
                "#,
                self.dump_table
            );
            let pool = &self.pool;

            let result = execute_with_retry("dump_progress_put", || {
                sqlx::query(&sql)
                    .bind(&collection)
                    .bind(count)
                    .bind(&token)
                    .bind(now)
                    .execute(pool)
            })
            .await;
            crate::metrics::record_checkpoint_write(&collection, "dump_progress", result.is_ok());
            result?;

            debug!(collection = %collection, count = progress.count, "Dump progress persisted");
            Ok(())
        })
    }

    fn get_resume_token(&self, collection: &str) -> CheckpointFuture<'_, Option<ResumeToken>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let sql = format!("SELECT token FROM {} WHERE collection = ?", self.resume_table);
            let row: Option<(Option<String>,)> = sqlx::query_as(&sql)
                .bind(&collection)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some((token,)) => Ok(Some(ResumeToken::new(decode_token(token)?))),
                None => Ok(None),
            }
        })
    }

    fn put_resume_token(&self, collection: &str, token: &ResumeToken) -> CheckpointFuture<'_, ()> {
        let collection = collection.to_string();
        let token = token.clone();
        Box::pin(async move {
            let encoded = encode_token(&token.token)?;
            let now = chrono::Utc::now().timestamp_millis();
            let sql = format!(
                r#"
                INSERT INTO {} (collection, token, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(collection) DO UPDATE SET
                    token = excluded.token,
                    updated_at = excluded.updated_at
                "#,
                self.resume_table
            );
            let pool = &self.pool;

            let result = execute_with_retry("resume_token_put", || {
                sqlx::query(&sql)
                    .bind(&collection)
                    .bind(&encoded)
                    .bind(now)
                    .execute(pool)
            })
            .await;
            crate::metrics::record_checkpoint_write(&collection, "resume_token", result.is_ok());
            result?;

            debug!(collection = %collection, absent = token.is_absent(), "Resume token persisted");
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local checkpoint store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    dump_progress: RwLock<HashMap<String, DumpProgress>>,
    resume_tokens: RwLock<HashMap<String, ResumeToken>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_dump_progress(&self, collection: &str) -> CheckpointFuture<'_, Option<DumpProgress>> {
        let collection = collection.to_string();
        Box::pin(async move { Ok(self.dump_progress.read().await.get(&collection).cloned()) })
    }

    fn put_dump_progress(&self, collection: &str, progress: &DumpProgress) -> CheckpointFuture<'_, ()> {
        let collection = collection.to_string();
        let progress = progress.clone();
        Box::pin(async move {
            self.dump_progress.write().await.insert(collection, progress);
            Ok(())
        })
    }

    fn get_resume_token(&self, collection: &str) -> CheckpointFuture<'_, Option<ResumeToken>> {
        let collection = collection.to_string();
        Box::pin(async move { Ok(self.resume_tokens.read().await.get(&collection).cloned()) })
    }

    fn put_resume_token(&self, collection: &str, token: &ResumeToken) -> CheckpointFuture<'_, ()> {
        let collection = collection.to_string();
        let token = token.clone();
        Box::pin(async move {
            self.resume_tokens.write().await.insert(collection, token);
            Ok(())
        })
    }
}
