//! Mock IndexEngine for testing.
//!
//! Keeps indexed documents in memory and applies writes with external
//! versioning: a write whose version is not newer than the stored one is
//! counted as a version conflict and ignored. Failures can be injected per
//! bulk call number, for replications, for collection deletes and for
//! schema registration.

use super::{Call, CallLog};
use index_replicator::bulk::{BulkBatch, BulkEntry, BulkOutcome};
use index_replicator::index::{IndexEngine, IndexError, IndexFuture, IndexMapping, VersionType};
use index_replicator::source::{ChangeEvent, Document};
use index_replicator::versioning::version_as_integer;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDoc {
    pub version: Option<u64>,
    pub source: Document,
}

pub struct MockIndex {
    log: CallLog,
    batch_size: usize,
    /// collection -> id -> doc
    docs: Mutex<HashMap<String, BTreeMap<String, IndexedDoc>>>,
    bulk_calls: AtomicUsize,
    fail_bulk_calls: Mutex<HashSet<usize>>,
    fail_replicate: AtomicBool,
    fail_deletes: AtomicUsize,
    /// collection -> registrations still to fail
    fail_register: Mutex<HashMap<String, usize>>,
    bulk_delay: Mutex<Option<Duration>>,
    /// Held closed to stall replications until opened.
    replicate_gate: Arc<Notify>,
    replicate_blocked: AtomicBool,
    version_conflicts: AtomicUsize,
}

impl MockIndex {
    pub fn new(log: CallLog, batch_size: usize) -> Self {
        Self {
            log,
            batch_size,
            docs: Mutex::new(HashMap::new()),
            bulk_calls: AtomicUsize::new(0),
            fail_bulk_calls: Mutex::new(HashSet::new()),
            fail_replicate: AtomicBool::new(false),
            fail_deletes: AtomicUsize::new(0),
            fail_register: Mutex::new(HashMap::new()),
            bulk_delay: Mutex::new(None),
            replicate_gate: Arc::new(Notify::new()),
            replicate_blocked: AtomicBool::new(false),
            version_conflicts: AtomicUsize::new(0),
        }
    }

    /// Fail the bulk write with this 0-based call number.
    pub fn fail_bulk_call(&self, call: usize) {
        self.fail_bulk_calls.lock().unwrap().insert(call);
    }

    pub fn set_fail_replicate(&self, fail: bool) {
        self.fail_replicate.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `times` delete_all_for calls.
    pub fn fail_deletes(&self, times: usize) {
        self.fail_deletes.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` schema registrations for `collection`.
    pub fn fail_registrations(&self, collection: &str, times: usize) {
        self.fail_register.lock().unwrap().insert(collection.to_string(), times);
    }

    /// Make every bulk write take at least `delay`.
    pub fn set_bulk_delay(&self, delay: Duration) {
        *self.bulk_delay.lock().unwrap() = Some(delay);
    }

    /// Stall replications until [`unblock_replications`](Self::unblock_replications).
    pub fn block_replications(&self) {
        self.replicate_blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock_replications(&self) {
        self.replicate_blocked.store(false, Ordering::SeqCst);
        self.replicate_gate.notify_waiters();
    }

    pub fn bulk_call_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn version_conflicts(&self) -> usize {
        self.version_conflicts.load(Ordering::SeqCst)
    }

    /// Indexed documents for `collection`, by id.
    pub fn documents(&self, collection: &str) -> BTreeMap<String, IndexedDoc> {
        self.docs.lock().unwrap().get(collection).cloned().unwrap_or_default()
    }

    /// Seed a document directly (bypassing the log).
    pub fn seed(&self, collection: &str, id: &str, version: Option<u64>, source: Document) {
        self.docs
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), IndexedDoc { version, source });
    }

    /// Apply one versioned write. Returns false on a version conflict.
    fn apply(&self, collection: &str, id: String, version: Option<u64>, source: Document) -> bool {
        let mut docs = self.docs.lock().unwrap();
        let coll = docs.entry(collection.to_string()).or_default();
        if let (Some(new), Some(existing)) = (version, coll.get(&id).and_then(|d| d.version)) {
            if new <= existing {
                self.version_conflicts.fetch_add(1, Ordering::SeqCst);
                return false;
            }
        }
        coll.insert(id, IndexedDoc { version, source });
        true
    }
}

impl IndexEngine for MockIndex {
    fn preferred_batch_size(&self) -> usize {
        self.batch_size
    }

    fn register_schema(&self, collection: &str) -> IndexFuture<'_, IndexMapping> {
        self.log.record(Call::RegisterSchema {
            collection: collection.to_string(),
        });
        let fail = match self.fail_register.lock().unwrap().get_mut(collection) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let mapping = IndexMapping {
            version_field: Some("v".to_string()),
            version_type: VersionType::External,
            ..IndexMapping::for_collection(collection)
        };
        Box::pin(async move {
            if fail {
                return Err(IndexError("mapping rejected".into()));
            }
            Ok(mapping)
        })
    }

    fn bulk_write(&self, batch: BulkBatch) -> IndexFuture<'_, BulkOutcome> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.log.record(Call::BulkWrite {
            collection: batch.collection().to_string(),
            ids: batch.operations().map(|op| op.id.clone()).collect(),
        });
        let fail = self.fail_bulk_calls.lock().unwrap().contains(&call);
        let delay = *self.bulk_delay.lock().unwrap();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(IndexError(format!("bulk call {} rejected", call)));
            }

            let mut outcome = BulkOutcome::default();
            let mut pending_op = None;
            for entry in batch.entries() {
                match entry {
                    BulkEntry::Action(op) => pending_op = Some(op.clone()),
                    BulkEntry::Source(doc) => {
                        if let Some(op) = pending_op.take() {
                            if self.apply(batch.collection(), op.id, op.version, doc.clone()) {
                                outcome.indexed += 1;
                            } else {
                                outcome.version_conflicts += 1;
                            }
                        }
                    }
                }
            }
            Ok(outcome)
        })
    }

    fn replicate_one(&self, collection: &str, change: ChangeEvent) -> IndexFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            if self.replicate_blocked.load(Ordering::SeqCst) {
                let notified = self.replicate_gate.notified();
                if self.replicate_blocked.load(Ordering::SeqCst) {
                    notified.await;
                }
            }

            let id = change.document_id.as_index_id();
            self.log.record(Call::Replicate {
                collection: collection.clone(),
                id: id.clone(),
            });
            if self.fail_replicate.load(Ordering::SeqCst) {
                return Err(IndexError(format!("replicate {} rejected", id)));
            }

            match change.full_document {
                None => {
                    if let Some(coll) = self.docs.lock().unwrap().get_mut(&collection) {
                        coll.remove(&id);
                    }
                }
                Some(mut doc) => {
                    doc.remove("_id");
                    let version = doc.get("v").and_then(version_as_integer);
                    self.apply(&collection, id, version, doc);
                }
            }
            Ok(())
        })
    }

    fn delete_all_for(&self, collection: &str) -> IndexFuture<'_, ()> {
        let collection = collection.to_string();
        self.log.record(Call::DeleteAll {
            collection: collection.clone(),
        });
        let fail = self
            .fail_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                return Err(IndexError("delete_by_query failed".into()));
            }
            self.docs.lock().unwrap().remove(&collection);
            Ok(())
        })
    }
}

/// Convenience accessor for a document's `name` field.
pub fn name_of(doc: &IndexedDoc) -> Option<&str> {
    doc.source.get("name").and_then(Value::as_str)
}
