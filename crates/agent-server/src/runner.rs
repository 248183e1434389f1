//! # Task Runner
//!
//! The parent side of the task execution core: forks one worker process
//! per request, relays the structured message protocol, enforces the
//! wall-clock timeout, records history, and reduces the worker's life
//! cycle to a single success-or-error outcome for the dispatch layer.
//!
//! Subtask records are routed through a [`SubtaskRouter`] so the runner
//! stays ignorant of queues; the dispatcher implements the routing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use agent_shared::config::AgentConfig;
use agent_shared::protocol::{
    ParentMessage, TaskRequest, WorkerMessage, EVENT_ERROR, EVENT_FINISH,
};
use agent_shared::{AgentError, AgentResult};

use crate::history::{HistoryStatus, TaskHistory};

/// How the runner invokes the worker entry point
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker program; defaults to this binary's `worker` subcommand
    pub worker_program: PathBuf,
    /// Arguments placed before the positional task path
    pub worker_args: Vec<String>,
    /// Virtual task-module root handed to workers
    pub taskspath: PathBuf,
    /// Directory for per-task worker log files
    pub logdir: PathBuf,
    /// Worker wall-clock timeout
    pub timeout: Duration,
    /// Forwarded verbatim to workers when configured
    pub fluentd_host: Option<String>,
    /// Agent config file path, forwarded so backend-driven tasks see the
    /// same configuration as the agent
    pub config_path: Option<PathBuf>,
    /// Extra environment entries for every worker; carries the backend
    /// selection so backend-driven tasks match the agent
    pub extra_env: Vec<(String, String)>,
}

impl RunnerConfig {
    pub fn from_agent_config(config: &AgentConfig, config_path: Option<PathBuf>) -> Self {
        let worker_program =
            std::env::current_exe().unwrap_or_else(|_| PathBuf::from("node-agent"));
        let mut extra_env = vec![("AGENT_BACKEND".to_string(), config.backend.as_str().to_string())];
        if let Some(root) = &config.simulation_root {
            extra_env.push((
                "AGENT_SIMULATION_ROOT".to_string(),
                root.display().to_string(),
            ));
        }
        Self {
            worker_program,
            worker_args: vec!["worker".to_string()],
            taskspath: PathBuf::from("tasks"),
            logdir: config.tasklogdir.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            fluentd_host: config.fluentd_host.clone(),
            config_path,
            extra_env,
        }
    }
}

/// Terminal result of one worker run: the finish payload on success or the
/// structured error payload on failure.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub result: Result<Value, Value>,
    pub history_id: u64,
}

/// Routes a worker's nested task request. `ancestry` carries the task
/// names already on the chain so cycles fail fast instead of recursing.
#[async_trait]
pub trait SubtaskRouter: Send + Sync {
    async fn run_subtask(
        &self,
        ancestry: Vec<String>,
        resource: String,
        task: String,
        params: Value,
    ) -> (String, Value);
}

#[derive(Debug, Default)]
struct WorkerState {
    error_count: u32,
    last_error: Option<Value>,
    finish_value: Option<Value>,
}

#[derive(Debug)]
pub struct TaskRunner {
    config: RunnerConfig,
    history: TaskHistory,
}

impl TaskRunner {
    pub fn new(config: RunnerConfig, history: TaskHistory) -> Self {
        Self { config, history }
    }

    pub fn history(&self) -> &TaskHistory {
        &self.history
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Fork a worker for `req` and supervise it to completion.
    pub async fn run(
        &self,
        req: TaskRequest,
        ancestry: &[String],
        router: Arc<dyn SubtaskRouter>,
    ) -> AgentResult<TaskOutcome> {
        let mut child = self.spawn_worker(&req)?;
        let pid = child.id().unwrap_or(0);
        let history_id = self.history.append(&req.task, pid, req.params.clone());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::internal("worker stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::internal("worker stdin not captured"))?;

        let mut log_file = self.open_task_log(&req.task, pid).await?;

        let mut state = WorkerState::default();
        let drive = self.drive_worker(
            &req,
            ancestry,
            router,
            history_id,
            stdout,
            stdin,
            &mut log_file,
            &mut state,
        );

        let timed_out = tokio::time::timeout(self.config.timeout, drive)
            .await
            .is_err();

        if timed_out {
            warn!(
                task = %req.task,
                pid = pid,
                timeout_seconds = self.config.timeout.as_secs(),
                "worker timed out; killing"
            );
            if let Err(e) = child.kill().await {
                warn!(pid = pid, error = %e, "failed to kill timed-out worker");
            }
            let seconds = self.config.timeout.as_secs();
            let error = json!({ "error": format!("timed out after {seconds}s") });
            state.error_count += 1;
            state.last_error = Some(error.clone());
            state.finish_value = None;
            for synthesized in [
                serde_json::to_value(WorkerMessage::event(EVENT_ERROR, error)).ok(),
                serde_json::to_value(WorkerMessage::event(EVENT_FINISH, json!({}))).ok(),
                serde_json::to_value(WorkerMessage::Finish).ok(),
            ]
            .into_iter()
            .flatten()
            {
                self.history.record_message(history_id, synthesized);
            }
        }

        let exit = child.wait().await?;
        if !timed_out && !exit.success() && state.finish_value.is_none() {
            // Worker crashed before completing the protocol.
            if state.last_error.is_none() {
                state.last_error = Some(json!({
                    "error": format!("worker exited abnormally: {exit}")
                }));
            }
            state.error_count += 1;
        }

        let error_count = state.error_count;
        self.history
            .update(history_id, |entry| entry.error_count = error_count);

        let failed = state.error_count > 0 || state.finish_value.is_none();
        let status = if failed {
            HistoryStatus::Failed
        } else {
            HistoryStatus::Finished
        };
        self.history.close(history_id, status);

        let result = if failed {
            Err(state
                .last_error
                .unwrap_or_else(|| json!({ "error": "task produced no result" })))
        } else {
            Ok(state
                .finish_value
                .unwrap_or_else(|| json!({})))
        };
        Ok(TaskOutcome { result, history_id })
    }

    fn spawn_worker(&self, req: &TaskRequest) -> AgentResult<Child> {
        let task_path = self.config.taskspath.join(&req.task);
        let mut cmd = Command::new(&self.config.worker_program);
        cmd.args(&self.config.worker_args)
            .arg(&task_path)
            .env("logdir", &self.config.logdir)
            .env("logtimestamp", Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string())
            .env("req_id", &req.req_id)
            .env("task", &req.task)
            .env("trace_id", Uuid::new_v4().to_string())
            .env("trace_enabled", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(id) = tracing::Span::current().id() {
            cmd.env("span_id", id.into_u64().to_string());
        }
        if let Some(host) = &self.config.fluentd_host {
            cmd.env("FLUENTD_HOST", host);
        }
        if let Some(path) = &self.config.config_path {
            cmd.env("AGENT_CONFIG_PATH", path);
        }
        for (key, value) in &self.config.extra_env {
            cmd.env(key, value);
        }

        debug!(task = %req.task, req_id = %req.req_id, "forking worker");
        cmd.spawn()
            .map_err(|e| AgentError::worker(format!("spawning worker: {e}")))
    }

    async fn open_task_log(&self, task: &str, pid: u32) -> AgentResult<tokio::fs::File> {
        tokio::fs::create_dir_all(&self.config.logdir).await?;
        let name = format!(
            "{}-{}-{}.log",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            pid,
            task
        );
        Ok(tokio::fs::File::create(self.config.logdir.join(name)).await?)
    }

    /// Pump the message protocol until the worker closes its stdout.
    #[allow(clippy::too_many_arguments)]
    async fn drive_worker(
        &self,
        req: &TaskRequest,
        ancestry: &[String],
        router: Arc<dyn SubtaskRouter>,
        history_id: u64,
        stdout: ChildStdout,
        stdin: ChildStdin,
        log_file: &mut tokio::fs::File,
        state: &mut WorkerState,
    ) {
        let mut lines = FramedRead::new(stdout, LinesCodec::new());
        let mut sink = FramedWrite::new(stdin, LinesCodec::new());

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(task = %req.task, error = %e, "unreadable worker output");
                    continue;
                }
            };
            let msg: WorkerMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(task = %req.task, error = %e, "unparseable worker record");
                    continue;
                }
            };

            match msg {
                WorkerMessage::Ready => {
                    let start = ParentMessage::Start {
                        req: req.clone(),
                        taskspath: self.config.taskspath.display().to_string(),
                    };
                    let line = match serde_json::to_string(&start) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "failed to encode start record");
                            break;
                        }
                    };
                    if sink.send(line).await.is_err() {
                        // Worker vanished between ready and start.
                        break;
                    }
                }
                WorkerMessage::Log { entry } => {
                    if let Ok(serialized) = serde_json::to_string(&entry) {
                        let _ = log_file
                            .write_all(format!("{serialized}\n").as_bytes())
                            .await;
                    }
                    self.history.record_log(history_id, entry);
                }
                WorkerMessage::Event {
                    ref name,
                    ref event,
                    ..
                } => {
                    let name = name.clone();
                    let event = event.clone();
                    if let Ok(v) = serde_json::to_value(&msg) {
                        self.history.record_message(history_id, v);
                    }
                    match name.as_str() {
                        EVENT_ERROR => {
                            state.error_count += 1;
                            state.last_error = Some(event);
                        }
                        EVENT_FINISH => {
                            state.finish_value = Some(event);
                        }
                        _ => {}
                    }
                }
                WorkerMessage::Subtask {
                    id,
                    resource,
                    task,
                    msg: params,
                } => {
                    self.history.record_message(
                        history_id,
                        json!({
                            "type": "subtask",
                            "id": &id,
                            "resource": &resource,
                            "task": &task,
                        }),
                    );
                    let (name, event) = if ancestry.contains(&task) || task == req.task {
                        warn!(task = %task, parent = %req.task, "subtask cycle rejected");
                        (
                            EVENT_ERROR.to_string(),
                            json!({ "error": format!("subtask cycle detected on {task}") }),
                        )
                    } else {
                        let mut chain = ancestry.to_vec();
                        chain.push(req.task.clone());
                        router
                            .run_subtask(chain, resource, task, params)
                            .await
                    };
                    let relay = ParentMessage::SubtaskResult { id, name, event };
                    let line = match serde_json::to_string(&relay) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "failed to encode subtask result");
                            continue;
                        }
                    };
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }
                WorkerMessage::Exception { error } => {
                    self.history.record_message(
                        history_id,
                        json!({ "type": "exception", "error": { "message": &error.message } }),
                    );
                    state.last_error = Some(json!({
                        "error": error.message,
                        "stack": error.stack,
                    }));
                }
                WorkerMessage::Finish => {
                    // The worker exits shortly after; drain until EOF.
                }
            }
        }
        let _ = log_file.flush().await;
    }
}
