use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Receives uploaded-byte deltas for files that feed an external aggregate (e.g. an
/// inventory monitor). Implementations must not block; errors are logged by the caller.
pub trait ProgressSink: Send + Sync {
    fn on_bytes_uploaded(&self, file_id: &str, delta: u64) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub file_id: String,
    pub chunks_created: u64,
    pub chunks_uploaded: u64,
    pub bytes_created: u64,
    pub bytes_uploaded: u64,
    pub concurrent_uploads: usize,
    pub max_concurrent_uploads: usize,
    pub last_chunk_duration_ms: Option<u64>,
    pub last_chunk_bytes: Option<u64>,
    pub slicing_complete: bool,
    pub failures: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    chunks_created: u64,
    chunks_uploaded: u64,
    bytes_created: u64,
    bytes_uploaded: u64,
    concurrent_uploads: usize,
    max_concurrent_uploads: usize,
    last_chunk_duration: Option<Duration>,
    last_chunk_bytes: Option<u64>,
    slicing_complete: bool,
    failures: Vec<Error>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Per-file upload accounting shared by the slicer, the workers and the orchestrator.
#[derive(Debug)]
pub struct ProgressState {
    file_id: String,
    source_name: Option<String>,
    inner: Mutex<Counters>,
}

impl ProgressState {
    pub fn new(file_id: impl Into<String>, source_name: Option<String>) -> Self {
        Self {
            file_id: file_id.into(),
            source_name,
            inner: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().expect("progress mutex poisoned")
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    pub fn mark_started(&self) {
        let mut c = self.lock();
        if c.started_at.is_none() {
            c.started_at = Some(Utc::now());
        }
    }

    pub fn mark_finished(&self) {
        self.lock().finished_at = Some(Utc::now());
    }

    pub fn record_chunk_created(&self, bytes: u64) {
        let mut c = self.lock();
        c.chunks_created += 1;
        c.bytes_created += bytes;
    }

    pub fn mark_slicing_complete(&self) {
        self.lock().slicing_complete = true;
    }

    /// Chunks handed to the queue that no worker has confirmed yet.
    pub fn pending_chunks(&self) -> u64 {
        let c = self.lock();
        c.chunks_created.saturating_sub(c.chunks_uploaded)
    }

    pub fn begin_upload(&self) {
        let mut c = self.lock();
        c.concurrent_uploads += 1;
        c.max_concurrent_uploads = c.max_concurrent_uploads.max(c.concurrent_uploads);
    }

    pub fn end_upload(&self) {
        let mut c = self.lock();
        c.concurrent_uploads = c.concurrent_uploads.saturating_sub(1);
    }

    pub fn record_chunk_uploaded(&self, bytes: u64, duration: Duration) {
        let mut c = self.lock();
        c.chunks_uploaded += 1;
        c.bytes_uploaded += bytes;
        c.last_chunk_duration = Some(duration);
        c.last_chunk_bytes = Some(bytes);
    }

    pub fn record_failure(&self, error: Error) {
        self.lock().failures.push(error);
    }

    pub fn has_failures(&self) -> bool {
        !self.lock().failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.lock().failures.len()
    }

    pub fn take_last_failure(&self) -> Option<Error> {
        self.lock().failures.pop()
    }

    /// True once slicing finished cleanly and every created chunk was confirmed.
    pub fn is_upload_complete(&self) -> bool {
        let c = self.lock();
        c.slicing_complete && c.chunks_uploaded == c.chunks_created
    }

    pub fn chunks_created(&self) -> u64 {
        self.lock().chunks_created
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.lock().bytes_uploaded
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let c = self.lock();
        ProgressSnapshot {
            file_id: self.file_id.clone(),
            chunks_created: c.chunks_created,
            chunks_uploaded: c.chunks_uploaded,
            bytes_created: c.bytes_created,
            bytes_uploaded: c.bytes_uploaded,
            concurrent_uploads: c.concurrent_uploads,
            max_concurrent_uploads: c.max_concurrent_uploads,
            last_chunk_duration_ms: c.last_chunk_duration.map(|d| d.as_millis() as u64),
            last_chunk_bytes: c.last_chunk_bytes,
            slicing_complete: c.slicing_complete,
            failures: c.failures.iter().map(|e| e.to_string()).collect(),
            started_at: c.started_at,
            finished_at: c.finished_at,
        }
    }
}
