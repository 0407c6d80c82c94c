// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index engine integration traits.
//!
//! Defines the interface to the search/index engine the replicator writes
//! into. Bulk-write mechanics, mapping management and the wire protocol
//! live behind this trait.
//!
//! # Idempotence
//!
//! Change events may be replayed after a reconnect (the resume token is
//! only persisted at feed teardown). Implementations must apply writes with
//! the version carried in each [`IndexOperation`](crate::bulk::IndexOperation)
//! (or derived from the change's document) so that a replayed write with a
//! version that is not newer is ignored.

use crate::bulk::{BulkBatch, BulkOutcome};
use crate::source::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Result type for index engine operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Type alias for boxed index engine futures.
pub type IndexFuture<'a, T> = Pin<Box<dyn Future<Output = IndexResult<T>> + Send + 'a>>;

/// Simplified error for index engine operations.
#[derive(Debug, Clone)]
pub struct IndexError(pub String);

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IndexError {}

/// How the index engine compares versions on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    /// Apply only if the new version is strictly greater.
    #[default]
    External,
    /// Apply if the new version is greater or equal.
    ExternalGte,
    /// Engine-managed versions; supplied versions are ignored.
    Internal,
}

impl std::fmt::Display for VersionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::ExternalGte => write!(f, "external_gte"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Mapping metadata for one collection, returned by schema registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMapping {
    /// Target index name.
    pub index: String,
    /// Document type within the index.
    pub doc_type: String,
    /// Source field holding the row identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Source field referencing a parent document, if any.
    #[serde(default)]
    pub parent_field: Option<String>,
    /// Source field the version is derived from, if any.
    #[serde(default)]
    pub version_field: Option<String>,
    /// Version comparison mode.
    #[serde(default)]
    pub version_type: VersionType,
}

fn default_id_field() -> String {
    "_id".to_string()
}

impl IndexMapping {
    /// Mapping that indexes `collection` into an index of the same name.
    pub fn for_collection(collection: &str) -> Self {
        Self {
            index: collection.to_string(),
            doc_type: "_doc".to_string(),
            id_field: default_id_field(),
            parent_field: None,
            version_field: None,
            version_type: VersionType::default(),
        }
    }
}

/// Trait defining what we need from the index engine.
///
/// The host process provides an implementation; tests use recording mocks.
pub trait IndexEngine: Send + Sync + 'static {
    /// Preferred number of documents per bulk request.
    fn preferred_batch_size(&self) -> usize;

    /// Register the collection's document shape with the mapping layer.
    fn register_schema(&self, collection: &str) -> IndexFuture<'_, IndexMapping>;

    /// Write a batch of operation/document pairs.
    fn bulk_write(&self, batch: BulkBatch) -> IndexFuture<'_, BulkOutcome>;

    /// Apply one live change (index the full document, or delete).
    ///
    /// Callers do not wait for this on the feed path; see
    /// [`StreamReplicator`](crate::stream::StreamReplicator).
    fn replicate_one(&self, collection: &str, change: ChangeEvent) -> IndexFuture<'_, ()>;

    /// Delete every indexed document that came from `collection`.
    fn delete_all_for(&self, collection: &str) -> IndexFuture<'_, ()>;
}

/// A no-op implementation for dry runs.
///
/// Logs operations but doesn't actually index anything.
#[derive(Clone)]
pub struct NoOpIndexEngine {
    batch_size: usize,
}

impl NoOpIndexEngine {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl Default for NoOpIndexEngine {
    fn default() -> Self {
        Self::new(500)
    }
}

impl IndexEngine for NoOpIndexEngine {
    fn preferred_batch_size(&self) -> usize {
        self.batch_size
    }

    fn register_schema(&self, collection: &str) -> IndexFuture<'_, IndexMapping> {
        let mapping = IndexMapping::for_collection(collection);
        Box::pin(async move { Ok(mapping) })
    }

    fn bulk_write(&self, batch: BulkBatch) -> IndexFuture<'_, BulkOutcome> {
        Box::pin(async move {
            tracing::debug!(docs = batch.doc_count(), "NoOp: would bulk write");
            Ok(BulkOutcome {
                indexed: batch.doc_count(),
                ..Default::default()
            })
        })
    }

    fn replicate_one(&self, collection: &str, change: ChangeEvent) -> IndexFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            tracing::debug!(
                collection = %collection,
                id = %change.document_id,
                op = ?change.op,
                "NoOp: would replicate change"
            );
            Ok(())
        })
    }

    fn delete_all_for(&self, collection: &str) -> IndexFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            tracing::debug!(collection = %collection, "NoOp: would delete collection documents");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChangeOp, DocumentId, FeedPosition};

    #[test]
    fn test_mapping_defaults_from_json() {
        let mapping: IndexMapping =
            serde_json::from_str(r#"{"index": "users", "doc_type": "user"}"#).unwrap();
        assert_eq!(mapping.id_field, "_id");
        assert_eq!(mapping.parent_field, None);
        assert_eq!(mapping.version_type, VersionType::External);
    }

    #[test]
    fn test_version_type_serde() {
        let vt: VersionType = serde_json::from_str(r#""external_gte""#).unwrap();
        assert_eq!(vt, VersionType::ExternalGte);
        assert_eq!(vt.to_string(), "external_gte");
    }

    #[tokio::test]
    async fn test_noop_engine_accepts_everything() {
        let engine = NoOpIndexEngine::new(10);
        assert_eq!(engine.preferred_batch_size(), 10);

        let mapping = engine.register_schema("orders").await.unwrap();
        assert_eq!(mapping.index, "orders");

        let change = ChangeEvent {
            position: FeedPosition::from("t1"),
            op: ChangeOp::Delete,
            document_id: DocumentId::from(1),
            full_document: None,
        };
        assert!(engine.replicate_one("orders", change).await.is_ok());
        assert!(engine.delete_all_for("orders").await.is_ok());

        let outcome = engine.bulk_write(BulkBatch::new("orders")).await.unwrap();
        assert_eq!(outcome.indexed, 0);
    }
}
