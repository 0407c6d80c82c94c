//! Fuzz target for bulk batch assembly.
//!
//! Arbitrary JSON objects become documents; building operations and the
//! NDJSON body must never panic, and every document gets one action line.

#![no_main]

use index_replicator::bulk::{BulkBatch, IndexOperation};
use index_replicator::index::{IndexMapping, VersionType};
use index_replicator::source::DocumentId;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &str| {
    let Ok(Value::Array(rows)) = serde_json::from_str::<Value>(data) else {
        return;
    };

    let mapping = IndexMapping {
        parent_field: Some("parent".to_string()),
        version_field: Some("v".to_string()),
        version_type: VersionType::External,
        ..IndexMapping::for_collection("fuzz")
    };

    let mut batch = BulkBatch::new("fuzz");
    for (i, row) in rows.into_iter().enumerate() {
        let Value::Object(mut doc) = row else { continue };
        let id = doc.remove("_id").map(DocumentId).unwrap_or_else(|| DocumentId::from(i as i64));
        let op = IndexOperation::for_document(&mapping, &id, &doc);
        batch.push(op, doc);
    }

    let body = batch.to_ndjson();
    assert_eq!(body.lines().count(), batch.len());
});
