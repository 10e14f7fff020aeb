use crate::models::log::LogEntry;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogStoreError {
    #[error("log storage error: {raw_error_message}")]
    Storage { raw_error_message: String },
}

/// LogStore: append-only bounded log stream per job. Cursors are opaque,
/// monotonically increasing, and stay valid across eviction (reads clamp to
/// the retained window).
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, job_id: Uuid, entry: LogEntry) -> Result<(), LogStoreError>;

    /// Entries from `start_cursor`, at most `count`. Returns the entries and
    /// the cursor to continue from.
    async fn range(&self, job_id: Uuid, start_cursor: u64, count: usize)
        -> Result<(Vec<LogEntry>, u64), LogStoreError>;

    /// Entries appended at or after `cursor`; blocks until something shows up
    /// or `timeout` elapses (then returns empty with the cursor unchanged).
    async fn tail(
        &self,
        job_id: Uuid,
        cursor: u64,
        timeout: Duration,
    ) -> Result<(Vec<LogEntry>, u64), LogStoreError>;
}

struct JobStream {
    // (sequence, entry); sequence keeps growing as the front is evicted
    entries: Mutex<VecDeque<(u64, LogEntry)>>,
    notify: Notify,
}

impl JobStream {
    fn new() -> Self {
        JobStream {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, entry: LogEntry, max_entries: usize) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next_seq = entries.back().map(|(seq, _)| seq + 1).unwrap_or(0);
        entries.push_back((next_seq, entry));
        while entries.len() > max_entries {
            entries.pop_front();
        }
        drop(entries);
        self.notify.notify_waiters();
    }

    fn collect_from(&self, cursor: u64, count: usize) -> (Vec<LogEntry>, u64) {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = Vec::new();
        let mut next_cursor = cursor;
        for (seq, entry) in entries.iter() {
            if *seq < cursor {
                continue;
            }
            if out.len() >= count {
                break;
            }
            out.push(entry.clone());
            next_cursor = seq + 1;
        }
        (out, next_cursor)
    }
}

/// Bounded in-memory implementation. Durable retention beyond the window is
/// delegated to the surrounding platform.
pub struct InMemoryLogStore {
    max_entries_per_job: usize,
    streams: RwLock<HashMap<Uuid, Arc<JobStream>>>,
}

impl InMemoryLogStore {
    pub fn new(max_entries_per_job: usize) -> Self {
        InMemoryLogStore {
            max_entries_per_job,
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn stream(&self, job_id: Uuid) -> Arc<JobStream> {
        if let Some(stream) = self
            .streams
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&job_id)
        {
            return stream.clone();
        }

        let mut streams = self.streams.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        streams.entry(job_id).or_insert_with(|| Arc::new(JobStream::new())).clone()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, job_id: Uuid, entry: LogEntry) -> Result<(), LogStoreError> {
        self.stream(job_id).push(entry, self.max_entries_per_job);
        Ok(())
    }

    async fn range(
        &self,
        job_id: Uuid,
        start_cursor: u64,
        count: usize,
    ) -> Result<(Vec<LogEntry>, u64), LogStoreError> {
        Ok(self.stream(job_id).collect_from(start_cursor, count))
    }

    async fn tail(
        &self,
        job_id: Uuid,
        cursor: u64,
        timeout: Duration,
    ) -> Result<(Vec<LogEntry>, u64), LogStoreError> {
        let stream = self.stream(job_id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = stream.notify.notified();
            let (entries, next_cursor) = stream.collect_from(cursor, usize::MAX);
            if !entries.is_empty() {
                return Ok((entries, next_cursor));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok((Vec::new(), cursor));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok((Vec::new(), cursor)),
            }
        }
    }
}
