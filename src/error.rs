// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the index replicator.
//!
//! Errors are categorized by the collaborator they came from (source store,
//! index engine, checkpoint store) and carry enough context to log usefully.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` | Yes | Cursor or change feed failure in the source store |
//! | `IndexEngine` | Yes | Bulk write or replication rejected by the index engine |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `Serialization` | No | A checkpoint record could not be encoded/decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Nothing in this crate treats an error as fatal to the process: the
//! coordinator logs, backs off and keeps converging. [`ReplicationError::is_retryable()`]
//! only decides whether an immediate retry is worthwhile.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Source store failure (cursor read, count, change feed).
    ///
    /// `code` carries the server error code when the source reports one;
    /// the stream replicator uses it to classify feed failures.
    #[error("Source error ({operation}): {message}")]
    Source {
        operation: String,
        code: Option<i32>,
        message: String,
    },

    /// Index engine failure (bulk write, delete, schema registration).
    #[error("Index engine error ({operation}): {message}")]
    IndexEngine { operation: String, message: String },

    /// SQLite error during checkpoint persistence.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// A checkpoint record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a source error without a server code.
    pub fn source_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Create an index engine error.
    pub fn index(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IndexEngine {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap a collaborator error from the source store.
    pub fn from_source_error(operation: impl Into<String>, err: crate::source::SourceError) -> Self {
        Self::Source {
            operation: operation.into(),
            code: err.code,
            message: err.message,
        }
    }

    /// Wrap a collaborator error from the index engine.
    pub fn from_index_error(operation: impl Into<String>, err: crate::index::IndexError) -> Self {
        Self::index(operation, err.0)
    }

    /// Server error code, if the source reported one.
    pub fn source_code(&self) -> Option<i32> {
        match self {
            Self::Source { code, .. } => *code,
            _ => None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => true,
            Self::IndexEngine { .. } => true,
            Self::CheckpointStore(_) => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<crate::source::SourceError> for ReplicationError {
    fn from(e: crate::source::SourceError) -> Self {
        Self::Source {
            operation: "unknown".to_string(),
            code: e.code,
            message: e.message,
        }
    }
}

impl From<crate::index::IndexError> for ReplicationError {
    fn from(e: crate::index::IndexError) -> Self {
        Self::index("unknown", e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexError;
    use crate::source::SourceError;

    #[test]
    fn test_is_retryable_source() {
        let err = ReplicationError::source_msg("find", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("find"));
    }

    #[test]
    fn test_is_retryable_index_engine() {
        let err = ReplicationError::index("bulk", "es_rejected_execution_exception");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bulk"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("empty collection name".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }

    #[test]
    fn test_source_code_carried_through_conversion() {
        let err: ReplicationError = SourceError::with_code(40585, "resume token not found").into();
        assert_eq!(err.source_code(), Some(40585));
        assert!(err.to_string().contains("resume token not found"));
    }

    #[test]
    fn test_index_error_conversion() {
        let err: ReplicationError = IndexError("mapping conflict".to_string()).into();
        assert!(matches!(err, ReplicationError::IndexEngine { .. }));
        assert_eq!(err.source_code(), None);
    }

    #[test]
    fn test_collaborator_errors_keep_operation() {
        let err = ReplicationError::from_source_error("find_matching", SourceError::with_code(11600, "interrupted"));
        assert_eq!(err.source_code(), Some(11600));
        assert!(err.to_string().contains("find_matching"));

        let err = ReplicationError::from_index_error("bulk_write", IndexError("rejected".into()));
        assert!(err.to_string().contains("bulk_write"));
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_serialization_error_not_retryable() {
        let json_err = serde_json::from_str::<u64>("not json").unwrap_err();
        let err: ReplicationError = json_err.into();
        assert!(!err.is_retryable());
    }
}
