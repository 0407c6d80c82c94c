// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source store integration traits.
//!
//! Defines what the replicator needs from the document store it copies from:
//! a sequential cursor over existing rows (ordered by ascending identifier,
//! optionally starting after a given identifier) and a change feed that can
//! resume from an opaque position.
//!
//! The cursor and the feed are both plain [`futures::Stream`]s. Feed
//! callbacks (change / close / error) are folded into one tagged
//! [`FeedEvent`] so the stream replicator can drive a single consuming loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::stream::{self, StreamExt};
//! use index_replicator::source::{
//!     ChangeFeed, DocumentStream, FeedPosition, RowFilter, SourceFuture, SourceStore,
//! };
//!
//! struct EmptySource;
//!
//! impl SourceStore for EmptySource {
//!     fn count_matching(&self, _collection: &str, _filter: &RowFilter) -> SourceFuture<'_, u64> {
//!         Box::pin(async { Ok(0) })
//!     }
//!
//!     fn find_matching(&self, _collection: &str, _filter: &RowFilter) -> SourceFuture<'_, DocumentStream> {
//!         Box::pin(async { Ok(stream::empty().boxed()) })
//!     }
//!
//!     fn open_change_feed(
//!         &self,
//!         _collection: &str,
//!         _resume_from: Option<FeedPosition>,
//!     ) -> SourceFuture<'_, ChangeFeed> {
//!         Box::pin(async { Ok(stream::pending().boxed()) })
//!     }
//! }
//! ```

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

/// A source row: a JSON object including its identifier field.
pub type Document = Map<String, Value>;

/// Result type for source store operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Type alias for boxed source futures (reduces trait signature complexity).
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + Send + 'a>>;

/// Sequential cursor over existing rows, ascending by identifier.
///
/// An `Err` item is a row-read failure; the backfill treats it as a soft
/// end of the pass.
pub type DocumentStream = BoxStream<'static, SourceResult<Document>>;

/// Live change feed. A stream that ends is treated as [`FeedEvent::Closed`].
pub type ChangeFeed = BoxStream<'static, FeedEvent>;

/// Error reported by the source store.
///
/// `code` is the server's numeric error code when one is available
/// (e.g. `40585` for a resume token that can no longer be found).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub code: Option<i32>,
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SourceError {}

/// Identifier of a source row (the `_id` field).
///
/// Opaque to the replicator apart from being handed back to the source in
/// [`RowFilter::After`]; ordering is the source's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Value);

impl DocumentId {
    /// Identifier rendered the way the index engine expects a document id.
    ///
    /// Strings are used as-is, extended-JSON object ids (`{"$oid": ".."}`)
    /// are unwrapped, anything else is rendered as compact JSON.
    pub fn as_index_id(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            Value::Object(obj) => match obj.get("$oid") {
                Some(Value::String(oid)) => oid.clone(),
                _ => self.0.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<i64> for DocumentId {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_index_id())
    }
}

/// Opaque change feed position (resume token) issued by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedPosition(pub Value);

impl From<&str> for FeedPosition {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

/// Row selection for the backfill cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    /// Every row in the collection.
    All,
    /// Rows whose identifier is strictly greater than the given one.
    After(DocumentId),
}

impl RowFilter {
    /// Filter that continues after `token`, or selects everything if absent.
    pub fn resume_from(token: Option<&DocumentId>) -> Self {
        match token {
            Some(id) => RowFilter::After(id.clone()),
            None => RowFilter::All,
        }
    }
}

/// Kind of change carried by a feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A single applied change from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Position of this event; becomes the resume token once seen.
    pub position: FeedPosition,
    /// Operation type
    pub op: ChangeOp,
    /// Identifier of the changed row
    pub document_id: DocumentId,
    /// Post-change document (looked up by the source); `None` for deletes.
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    /// Check if this is a delete.
    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}

/// Everything a change feed can report.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A normal change to replicate.
    Changed(ChangeEvent),
    /// The feed can no longer continue meaningfully (structural change,
    /// collection dropped/renamed). Forces a full resync.
    Invalidated,
    /// The feed ended.
    Closed,
    /// The feed failed. `code` is the source's error code, if any.
    Errored { code: Option<i32>, message: String },
}

impl From<SourceError> for FeedEvent {
    fn from(e: SourceError) -> Self {
        FeedEvent::Errored {
            code: e.code,
            message: e.message,
        }
    }
}

/// Trait defining what we need from the source store.
///
/// All calls are scoped to one collection by name.
pub trait SourceStore: Send + Sync + 'static {
    /// Count rows matching `filter`.
    fn count_matching(&self, collection: &str, filter: &RowFilter) -> SourceFuture<'_, u64>;

    /// Open a cursor over rows matching `filter`, ascending by identifier.
    fn find_matching(&self, collection: &str, filter: &RowFilter) -> SourceFuture<'_, DocumentStream>;

    /// Open a change feed, resuming after `resume_from` or from "now" if `None`.
    ///
    /// Events must carry the full post-change document for non-deletes.
    fn open_change_feed(
        &self,
        collection: &str,
        resume_from: Option<FeedPosition>,
    ) -> SourceFuture<'_, ChangeFeed>;
}
