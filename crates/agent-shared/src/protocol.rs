//! # Worker Wire Protocol
//!
//! Message types exchanged between the task runner (parent) and a worker
//! (child process) as line-delimited JSON over the child's stdin/stdout.
//!
//! The child speaks first with `ready`, the parent answers with `start`,
//! then the child emits any number of `log`/`event`/`subtask` records and
//! terminates the exchange with an `event` named `finish` (success) or an
//! `event` named `error` followed by a `finish`-named event (failure),
//! closing with a bare `finish` record before exiting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Strings recorded into task history are cut at this many characters.
pub const MAX_RECORDED_STRING: usize = 1000;

/// Well-known event names
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_FINISH: &str = "finish";
pub const EVENT_SUBTASK_RESULT: &str = "subtask-result";

/// A task submission as accepted by the HTTP surface and handed to the
/// worker. `params` is opaque and passes through to the task untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    pub params: Value,
    pub req_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_host: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TaskRequest {
    /// Build a request, generating a correlation id when the caller did not
    /// supply one.
    pub fn new(task: impl Into<String>, params: Value, req_id: Option<String>) -> Self {
        Self {
            task: task.into(),
            params,
            req_id: req_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            req_host: None,
            created_at: Utc::now(),
        }
    }

    /// Seconds elapsed since this request was accepted
    pub fn age_secs(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }
}

/// A log record forwarded from the worker to the parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Info,
    Warn,
    Error,
}

/// Failure detail reported by a worker that could not run its task at all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Child → parent records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Emitted exactly once at startup, before the parent sends `start`
    Ready,
    /// A forwarded task log record
    Log { entry: LogRecord },
    /// A named life-cycle event. `error`-named events are non-terminal and
    /// counted; a `finish`-named event carries the task result.
    Event {
        name: String,
        event: Value,
        timestamp: DateTime<Utc>,
    },
    /// Request that the parent run a nested task and reply with its
    /// terminal event under `id`
    Subtask {
        id: String,
        resource: String,
        task: String,
        msg: Value,
    },
    /// Uncaught failure while loading or running the task
    Exception { error: ExceptionInfo },
    /// The worker is done and about to exit
    Finish,
}

impl WorkerMessage {
    /// Build an event record stamped with the current time
    pub fn event(name: impl Into<String>, event: Value) -> Self {
        WorkerMessage::Event {
            name: name.into(),
            event,
            timestamp: Utc::now(),
        }
    }
}

/// Parent → child records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ParentMessage {
    /// First message after `ready`: run this request
    #[serde(rename = "start")]
    Start { req: TaskRequest, taskspath: String },
    /// Terminal event of a nested task requested via `subtask`
    #[serde(rename = "subtask-result")]
    SubtaskResult {
        id: String,
        name: String,
        event: Value,
    },
}

/// Deep-walk a JSON value and truncate every string leaf longer than
/// `max` characters. Applied to worker messages before they are recorded
/// into the bounded task history.
pub fn truncate_strings(value: &mut Value, max: usize) {
    match value {
        Value::String(s) => {
            if s.chars().count() > max {
                *s = s.chars().take(max).collect();
            }
        }
        Value::Array(items) => {
            for item in items {
                truncate_strings(item, max);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                truncate_strings(v, max);
            }
        }
        _ => {}
    }
}
