//! Mock SourceStore for testing.
//!
//! Rows are kept in identifier order (integer ids) and honor
//! `RowFilter::After`. Change feeds are scripted: each `open_change_feed`
//! pops the next [`FeedScript`]; with none queued the feed stays open and
//! silent until dropped.

use super::{Call, CallLog};
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use index_replicator::pause::PauseGate;
use index_replicator::source::{
    ChangeFeed, Document, DocumentStream, FeedEvent, FeedPosition, RowFilter, SourceError, SourceFuture,
    SourceStore,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What the next opened feed does.
pub enum FeedScript {
    /// Emit these events, then stay open.
    Events(Vec<FeedEvent>),
    /// Emit these events, then end the stream.
    EventsThenEnd(Vec<FeedEvent>),
    /// Fail to open.
    OpenError(SourceError),
    /// Events pushed by the test through a channel.
    Channel(mpsc::UnboundedReceiver<FeedEvent>),
}

/// Fault injected into the next cursor(s).
#[derive(Clone)]
enum CursorFault {
    /// Yield a read error after this many rows.
    ReadErrorAfter(usize),
    /// Close the gate when this many rows have been yielded.
    PauseAfter(usize, Arc<PauseGate>),
}

pub struct MockSource {
    log: CallLog,
    rows: Mutex<BTreeMap<i64, Document>>,
    feeds: Mutex<VecDeque<FeedScript>>,
    faults: Mutex<VecDeque<CursorFault>>,
    count_error: Mutex<Option<SourceError>>,
}

impl MockSource {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            rows: Mutex::new(BTreeMap::new()),
            feeds: Mutex::new(VecDeque::new()),
            faults: Mutex::new(VecDeque::new()),
            count_error: Mutex::new(None),
        }
    }

    pub fn with_rows(log: CallLog, rows: Vec<Document>) -> Self {
        let source = Self::new(log);
        for row in rows {
            source.insert(row);
        }
        source
    }

    /// Insert or replace a row (keyed by its integer `_id`).
    pub fn insert(&self, row: Document) {
        let id = row.get("_id").and_then(|v| v.as_i64()).expect("row needs an integer _id");
        self.rows.lock().unwrap().insert(id, row);
    }

    /// Insert a row with no `_id` at the end of iteration order.
    pub fn insert_without_id(&self, key: i64, mut row: Document) {
        row.remove("_id");
        self.rows.lock().unwrap().insert(key, row);
    }

    pub fn push_feed(&self, script: FeedScript) {
        self.feeds.lock().unwrap().push_back(script);
    }

    /// Queue a feed driven by the returned sender.
    pub fn push_channel_feed(&self) -> mpsc::UnboundedSender<FeedEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.push_feed(FeedScript::Channel(rx));
        tx
    }

    /// Next cursor yields an error after `rows` rows.
    pub fn fail_read_after(&self, rows: usize) {
        self.faults.lock().unwrap().push_back(CursorFault::ReadErrorAfter(rows));
    }

    /// Next cursor closes `gate` once it has yielded `rows` rows.
    pub fn pause_after(&self, rows: usize, gate: Arc<PauseGate>) {
        self.faults.lock().unwrap().push_back(CursorFault::PauseAfter(rows, gate));
    }

    /// Next `count_matching` fails.
    pub fn fail_next_count(&self, err: SourceError) {
        *self.count_error.lock().unwrap() = Some(err);
    }

    fn matching(&self, filter: &RowFilter) -> Vec<Document> {
        let rows = self.rows.lock().unwrap();
        match filter {
            RowFilter::All => rows.values().cloned().collect(),
            RowFilter::After(id) => {
                let after = id.0.as_i64().expect("integer ids only");
                rows.range(after + 1..).map(|(_, row)| row.clone()).collect()
            }
        }
    }
}

impl SourceStore for MockSource {
    fn count_matching(&self, collection: &str, filter: &RowFilter) -> SourceFuture<'_, u64> {
        self.log.record(Call::CountMatching {
            collection: collection.to_string(),
            filter: filter.clone(),
        });
        let result = match self.count_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(self.matching(filter).len() as u64),
        };
        Box::pin(async move { result })
    }

    fn find_matching(&self, collection: &str, filter: &RowFilter) -> SourceFuture<'_, DocumentStream> {
        self.log.record(Call::FindMatching {
            collection: collection.to_string(),
            filter: filter.clone(),
        });
        let rows = self.matching(filter);
        let fault = self.faults.lock().unwrap().pop_front();

        let cursor: DocumentStream = match fault {
            None => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Some(CursorFault::ReadErrorAfter(n)) => {
                let head: Vec<_> = rows.into_iter().take(n).map(Ok).collect();
                stream::iter(head)
                    .chain(stream::once(async { Err(SourceError::new("cursor killed")) }))
                    .boxed()
            }
            Some(CursorFault::PauseAfter(n, gate)) => stream::iter(rows.into_iter().enumerate())
                .map(move |(i, row)| {
                    if i + 1 == n {
                        gate.pause();
                    }
                    Ok(row)
                })
                .boxed(),
        };
        Box::pin(async move { Ok(cursor) })
    }

    fn open_change_feed(&self, collection: &str, resume_from: Option<FeedPosition>) -> SourceFuture<'_, ChangeFeed> {
        self.log.record(Call::OpenFeed {
            collection: collection.to_string(),
            resume_from,
        });
        let script = self.feeds.lock().unwrap().pop_front();
        let result = match script {
            None => Ok(stream::pending().boxed()),
            Some(FeedScript::Events(events)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
            Some(FeedScript::EventsThenEnd(events)) => Ok(stream::iter(events).boxed()),
            Some(FeedScript::OpenError(err)) => Err(err),
            Some(FeedScript::Channel(rx)) => Ok(rx.boxed()),
        };
        Box::pin(async move { result })
    }
}
