//! Shared test utilities for the integration suites.
//!
//! This module provides:
//! - A shared [`CallLog`] so tests can assert the order of collaborator calls
//! - `MockSource`: scripted rows and change feeds
//! - `MockIndex`: in-memory index with external version checks
//! - `RecordingCheckpointStore`: in-memory checkpoints that log every write
//! - Document / change event helpers

#![allow(dead_code)]

pub mod mock_checkpoint;
pub mod mock_index;
pub mod mock_source;

pub use mock_checkpoint::*;
pub use mock_index::*;
pub use mock_source::*;

use index_replicator::source::{ChangeEvent, ChangeOp, Document, DocumentId, FeedPosition, RowFilter};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CountMatching { collection: String, filter: RowFilter },
    FindMatching { collection: String, filter: RowFilter },
    OpenFeed { collection: String, resume_from: Option<FeedPosition> },
    RegisterSchema { collection: String },
    BulkWrite { collection: String, ids: Vec<String> },
    Replicate { collection: String, id: String },
    DeleteAll { collection: String },
    PutDumpProgress { collection: String, count: u64, token: Option<DocumentId> },
    PutResumeToken { collection: String, token: Option<FeedPosition> },
}

/// Shared, ordered record of calls across all mocks.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// Calls matching `pred`, in order.
    pub fn filtered(&self, pred: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.calls().into_iter().filter(|c| pred(c)).collect()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    pub fn bulk_ids(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BulkWrite { ids, .. } => Some(ids),
                _ => None,
            })
            .collect()
    }

    pub fn dump_progress_writes(&self) -> Vec<(u64, Option<DocumentId>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PutDumpProgress { count, token, .. } => Some((count, token)),
                _ => None,
            })
            .collect()
    }

    pub fn feed_opens(&self) -> Vec<Option<FeedPosition>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::OpenFeed { resume_from, .. } => Some(resume_from),
                _ => None,
            })
            .collect()
    }
}

/// A source row `{"_id": id, "v": version, "name": "doc-<id>"}`.
pub fn doc(id: i64, version: u64) -> Document {
    match json!({"_id": id, "v": version, "name": format!("doc-{}", id)}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Rows with the given ids, all at version 1.
pub fn docs(ids: impl IntoIterator<Item = i64>) -> Vec<Document> {
    ids.into_iter().map(|id| doc(id, 1)).collect()
}

/// A change event at `position` for document `id`.
pub fn change(position: &str, op: ChangeOp, id: i64, version: u64) -> ChangeEvent {
    let full_document = match op {
        ChangeOp::Delete => None,
        _ => Some(doc(id, version)),
    };
    ChangeEvent {
        position: FeedPosition::from(position),
        op,
        document_id: DocumentId::from(id),
        full_document,
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Install a test subscriber once (honors RUST_LOG).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
