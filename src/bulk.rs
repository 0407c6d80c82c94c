//! Bulk batches for the backfill.
//!
//! A batch is an ordered sequence of (operation descriptor, document) pairs,
//! i.e. two slots per document, in source-iteration order:
//!
//! ```text
//! [ Action(id=1), Source(doc 1), Action(id=2), Source(doc 2), ... ]
//! ```
//!
//! The backfill flushes a batch once it holds `batch_size` documents
//! (`2 × batch_size` entries) and once more at end of cursor.

use crate::index::{IndexMapping, VersionType};
use crate::source::{Document, DocumentId};
use crate::versioning::version_as_integer;
use serde_json::{json, Map, Value};

/// Index-operation descriptor for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOperation {
    /// Target index name.
    pub index: String,
    /// Document type.
    pub doc_type: String,
    /// Document id (the source identifier).
    pub id: String,
    /// Parent document reference, if the mapping declares one.
    pub parent: Option<Value>,
    /// Version for optimistic concurrency, if derivable.
    pub version: Option<u64>,
    /// How the engine compares `version`.
    pub version_type: VersionType,
}

impl IndexOperation {
    /// Build the descriptor for `doc` (whose identifier has already been
    /// removed and is passed as `id`).
    pub fn for_document(mapping: &IndexMapping, id: &DocumentId, doc: &Document) -> Self {
        let parent = mapping
            .parent_field
            .as_deref()
            .and_then(|field| doc.get(field))
            .cloned();
        let version = mapping
            .version_field
            .as_deref()
            .and_then(|field| doc.get(field))
            .and_then(version_as_integer);

        Self {
            index: mapping.index.clone(),
            doc_type: mapping.doc_type.clone(),
            id: id.as_index_id(),
            parent,
            version,
            version_type: mapping.version_type,
        }
    }

    /// Bulk action line (`{"index": {...}}`) for this operation.
    pub fn to_action_json(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("_index".into(), json!(self.index));
        meta.insert("_type".into(), json!(self.doc_type));
        meta.insert("_id".into(), json!(self.id));
        if let Some(parent) = &self.parent {
            meta.insert("_parent".into(), parent.clone());
        }
        if let Some(version) = self.version {
            if self.version_type != VersionType::Internal {
                meta.insert("version".into(), json!(version));
                meta.insert("version_type".into(), json!(self.version_type.to_string()));
            }
        }
        json!({ "index": Value::Object(meta) })
    }
}

/// One slot of a bulk batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkEntry {
    Action(IndexOperation),
    Source(Document),
}

/// Ordered operation/document pairs destined for one bulk request.
#[derive(Debug, Clone, Default)]
pub struct BulkBatch {
    collection: String,
    entries: Vec<BulkEntry>,
}

impl BulkBatch {
    /// Create an empty batch for `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entries: Vec::new(),
        }
    }

    /// Collection the batch was read from.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Append a document and its descriptor.
    pub fn push(&mut self, op: IndexOperation, doc: Document) {
        self.entries.push(BulkEntry::Action(op));
        self.entries.push(BulkEntry::Source(doc));
    }

    /// Number of slots (two per document).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of documents in the batch.
    pub fn doc_count(&self) -> usize {
        self.entries.len() / 2
    }

    /// True once the batch holds `batch_size` documents.
    pub fn is_full(&self, batch_size: usize) -> bool {
        !self.entries.is_empty() && self.entries.len() >= batch_size.saturating_mul(2)
    }

    /// Move the accumulated entries out, leaving an empty batch behind.
    pub fn take(&mut self) -> BulkBatch {
        BulkBatch {
            collection: self.collection.clone(),
            entries: std::mem::take(&mut self.entries),
        }
    }

    /// Entries in flush order.
    pub fn entries(&self) -> &[BulkEntry] {
        &self.entries
    }

    /// Descriptors in flush order.
    pub fn operations(&self) -> impl Iterator<Item = &IndexOperation> {
        self.entries.iter().filter_map(|e| match e {
            BulkEntry::Action(op) => Some(op),
            BulkEntry::Source(_) => None,
        })
    }

    /// Newline-delimited request body (action line, source line, ...).
    pub fn to_ndjson(&self) -> String {
        let mut body = String::new();
        for entry in &self.entries {
            let line = match entry {
                BulkEntry::Action(op) => op.to_action_json(),
                BulkEntry::Source(doc) => Value::Object(doc.clone()),
            };
            body.push_str(&line.to_string());
            body.push('\n');
        }
        body
    }
}

/// Result reported by the index engine for one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Documents written.
    pub indexed: usize,
    /// Documents skipped because the stored version was not older.
    pub version_conflicts: usize,
    /// Documents rejected for any other reason.
    pub failed: usize,
}

impl BulkOutcome {
    /// Check if every document was written or already current.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}
