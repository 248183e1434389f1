//! # Task History
//!
//! A bounded, in-memory record of recent task executions served by
//! `GET /history`. The runner appends an entry per dispatch and mutates it
//! as worker messages arrive; readers take a snapshot. The ring keeps the
//! 16 most recent entries.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use agent_shared::protocol::{truncate_strings, LogRecord, MAX_RECORDED_STRING};

/// Entries retained before the oldest is evicted
pub const HISTORY_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Active,
    Finished,
    Failed,
}

/// One task execution as exposed by `/history`
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    #[serde(skip)]
    id: u64,
    pub task: String,
    pub pid: u32,
    pub params: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: HistoryStatus,
    pub error_count: u32,
    /// Structured worker events, in arrival order, strings truncated
    pub messages: Vec<Value>,
    /// Forwarded worker log records
    pub log: Vec<LogRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    entries: VecDeque<HistoryEntry>,
}

/// Shared handle to the history ring
#[derive(Debug, Clone, Default)]
pub struct TaskHistory {
    inner: Arc<Mutex<Inner>>,
}

impl TaskHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh entry for a dispatched task, evicting the oldest
    /// entry when the ring is full. Returns the id used for later updates.
    pub fn append(&self, task: &str, pid: u32, params: Value) -> u64 {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner.seq += 1;
        let id = inner.seq;

        let mut params = params;
        truncate_strings(&mut params, MAX_RECORDED_STRING);

        inner.entries.push_back(HistoryEntry {
            id,
            task: task.to_string(),
            pid,
            params,
            started_at: Utc::now(),
            finished_at: None,
            status: HistoryStatus::Active,
            error_count: 0,
            messages: Vec::new(),
            log: Vec::new(),
        });
        while inner.entries.len() > HISTORY_LIMIT {
            inner.entries.pop_front();
        }
        id
    }

    /// Mutate the entry with `id`. A no-op when the entry has been evicted.
    pub fn update<F>(&self, id: u64, mutate: F)
    where
        F: FnOnce(&mut HistoryEntry),
    {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            mutate(entry);
        }
    }

    /// Record a structured worker message, truncating long strings
    pub fn record_message(&self, id: u64, mut message: Value) {
        truncate_strings(&mut message, MAX_RECORDED_STRING);
        self.update(id, |entry| entry.messages.push(message));
    }

    /// Record a forwarded log record, truncating its message text
    pub fn record_log(&self, id: u64, mut record: LogRecord) {
        if record.message.chars().count() > MAX_RECORDED_STRING {
            record.message = record.message.chars().take(MAX_RECORDED_STRING).collect();
        }
        self.update(id, |entry| entry.log.push(record));
    }

    /// Close the entry as finished or failed
    pub fn close(&self, id: u64, status: HistoryStatus) {
        self.update(id, |entry| {
            entry.status = status;
            entry.finished_at = Some(Utc::now());
        });
    }

    /// Snapshot of the ring, oldest first
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("history lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
