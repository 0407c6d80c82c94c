//! Checkpoint store that records every write in the shared [`CallLog`].

use super::{Call, CallLog};
use index_replicator::checkpoint::{CheckpointFuture, CheckpointStore, DumpProgress, MemoryCheckpointStore, ResumeToken};
use index_replicator::error::ReplicationError;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RecordingCheckpointStore {
    log: CallLog,
    inner: MemoryCheckpointStore,
    fail_reads: AtomicBool,
}

impl RecordingCheckpointStore {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            inner: MemoryCheckpointStore::new(),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Store dump progress without logging it.
    pub async fn preload_dump_progress(&self, collection: &str, progress: DumpProgress) {
        self.inner.put_dump_progress(collection, &progress).await.unwrap();
    }

    /// Store a resume token without logging it.
    pub async fn preload_resume_token(&self, collection: &str, token: ResumeToken) {
        self.inner.put_resume_token(collection, &token).await.unwrap();
    }

    /// Make every read fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub async fn dump_progress(&self, collection: &str) -> Option<DumpProgress> {
        self.inner.get_dump_progress(collection).await.unwrap()
    }

    pub async fn resume_token(&self, collection: &str) -> Option<ResumeToken> {
        self.inner.get_resume_token(collection).await.unwrap()
    }

    fn read_failure(&self) -> Option<ReplicationError> {
        self.fail_reads
            .load(Ordering::SeqCst)
            .then(|| ReplicationError::Internal("checkpoint store unavailable".into()))
    }
}

impl CheckpointStore for RecordingCheckpointStore {
    fn get_dump_progress(&self, collection: &str) -> CheckpointFuture<'_, Option<DumpProgress>> {
        match self.read_failure() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => self.inner.get_dump_progress(collection),
        }
    }

    fn put_dump_progress(&self, collection: &str, progress: &DumpProgress) -> CheckpointFuture<'_, ()> {
        self.log.record(Call::PutDumpProgress {
            collection: collection.to_string(),
            count: progress.count,
            token: progress.token.clone(),
        });
        self.inner.put_dump_progress(collection, progress)
    }

    fn get_resume_token(&self, collection: &str) -> CheckpointFuture<'_, Option<ResumeToken>> {
        match self.read_failure() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => self.inner.get_resume_token(collection),
        }
    }

    fn put_resume_token(&self, collection: &str, token: &ResumeToken) -> CheckpointFuture<'_, ()> {
        self.log.record(Call::PutResumeToken {
            collection: collection.to_string(),
            token: token.token.clone(),
        });
        self.inner.put_resume_token(collection, token)
    }
}
