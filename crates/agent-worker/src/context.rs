//! # Task Context
//!
//! The surface a task sees while it runs: progress and event emission,
//! forwarded logging, nested subtasks, and explicit finish/fatal. Every
//! method funnels into the outbound message channel the runtime drains to
//! stdout, so emission order is preserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use agent_shared::protocol::{
    LogLevel, LogRecord, TaskRequest, WorkerMessage, EVENT_ERROR, EVENT_FINISH, EVENT_PROGRESS,
};
use agent_shared::{AgentError, AgentResult};

/// Terminal event of a nested task, relayed back by the parent
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub name: String,
    pub event: Value,
}

impl SubtaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.name == EVENT_FINISH
    }
}

#[derive(Debug)]
struct Inner {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    req: TaskRequest,
    finished: AtomicBool,
    subtask_seq: AtomicU64,
    pending_subtasks: Mutex<HashMap<String, oneshot::Sender<SubtaskOutcome>>>,
}

/// Handle handed to a running task. Cheap to clone; all clones share the
/// same finished flag and subtask table.
#[derive(Debug, Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

impl TaskContext {
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>, req: TaskRequest) -> Self {
        Self {
            inner: Arc::new(Inner {
                tx,
                req,
                finished: AtomicBool::new(false),
                subtask_seq: AtomicU64::new(0),
                pending_subtasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The request this worker is serving
    pub fn req(&self) -> &TaskRequest {
        &self.inner.req
    }

    /// Whether a terminal event has already been emitted
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    fn send(&self, msg: WorkerMessage) {
        // The writer side only closes when the runtime is tearing down;
        // messages emitted after that point have nowhere to go.
        let _ = self.inner.tx.send(msg);
    }

    /// Report task progress, 0–100
    pub fn progress(&self, value: u32) {
        self.send(WorkerMessage::event(
            EVENT_PROGRESS,
            json!({ "value": value }),
        ));
    }

    /// Emit a named event. `error`-named events are counted by the parent
    /// but are not terminal.
    pub fn emit_event(&self, name: &str, payload: Value) {
        self.send(WorkerMessage::event(name, payload));
    }

    /// Mark the task successful with `result` as the caller-visible payload
    pub fn finish(&self, result: Value) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(WorkerMessage::event(EVENT_FINISH, result));
    }

    /// Mark the task failed: an error event carrying `msg` (and optional
    /// extra detail) followed by an empty finish event.
    pub fn fatal(&self, msg: &str, extra: Option<Value>) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut payload = json!({ "error": msg });
        if let Some(extra) = extra {
            payload["extra"] = extra;
        }
        self.send(WorkerMessage::event(EVENT_ERROR, payload));
        self.send(WorkerMessage::event(EVENT_FINISH, json!({})));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.send(WorkerMessage::Log {
            entry: LogRecord {
                level,
                message: message.into(),
                timestamp: chrono::Utc::now(),
                fields: serde_json::Map::new(),
            },
        });
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn log_warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn log_trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message);
    }

    /// Ask the parent to run a nested task and wait for its terminal event.
    /// `resource` routes the subtask; only the local resource is served.
    pub async fn subtask(
        &self,
        resource: &str,
        task: &str,
        params: Value,
    ) -> AgentResult<SubtaskOutcome> {
        let id = format!(
            "{}-{}",
            self.inner.req.req_id,
            self.inner.subtask_seq.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_subtasks
            .lock()
            .expect("subtask table poisoned")
            .insert(id.clone(), tx);

        self.send(WorkerMessage::Subtask {
            id,
            resource: resource.to_string(),
            task: task.to_string(),
            msg: params,
        });

        rx.await
            .map_err(|_| AgentError::worker("parent went away before subtask completed"))
    }

    /// Route a relayed subtask result to its waiter. Unknown ids are
    /// ignored; the parent may relay after a task has given up waiting.
    pub fn resolve_subtask(&self, id: &str, outcome: SubtaskOutcome) {
        let waiter = self
            .inner
            .pending_subtasks
            .lock()
            .expect("subtask table poisoned")
            .remove(id);
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }
}
