//! # Worker Child Loop
//!
//! Drives one task from spawn to exit:
//!
//! 1. emit `ready` on stdout
//! 2. wait for the parent's `start` (bounded; a silent parent means the
//!    runner died between fork and start)
//! 3. resolve the task named by the positional `taskspath/<task>` argument
//! 4. run it, forwarding context emissions in order, routing relayed
//!    `subtask-result` records back to their waiters
//! 5. close with the terminal event protocol and a bare `finish` record
//!
//! Stdout belongs to the protocol; all human-facing logging goes to stderr.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, warn};

use agent_shared::protocol::{ExceptionInfo, ParentMessage, WorkerMessage};
use agent_shared::{AgentError, AgentResult};

use crate::context::{SubtaskOutcome, TaskContext};
use crate::tasks::TaskRegistry;

/// How long to wait for the parent's `start` before giving up
const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the worker over stdin/stdout.
pub async fn run(task_path: &str, registry: &TaskRegistry) -> AgentResult<()> {
    run_on(task_path, registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Transport-generic worker loop; the tests drive it over duplex pipes.
pub async fn run_on<R, W>(
    task_path: &str,
    registry: &TaskRegistry,
    reader: R,
    writer: W,
) -> AgentResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines_in = FramedRead::new(reader, LinesCodec::new());
    let mut lines_out = FramedWrite::new(writer, LinesCodec::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();

    // One writer serializes every outbound record, preserving emission order.
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let line = match serde_json::to_string(&msg) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "dropping unserializable worker message");
                    continue;
                }
            };
            if lines_out.send(line).await.is_err() {
                // Parent hung up; nothing left to tell anyone.
                break;
            }
        }
        let _ = SinkExt::<String>::flush(&mut lines_out).await;
    });

    tx.send(WorkerMessage::Ready)
        .map_err(|_| AgentError::worker("writer closed before ready"))?;

    let start = tokio::time::timeout(START_TIMEOUT, read_parent(&mut lines_in)).await;
    let (req, _taskspath) = match start {
        Ok(Ok(Some(ParentMessage::Start { req, taskspath }))) => (req, taskspath),
        Ok(Ok(Some(other))) => {
            return Err(AgentError::protocol(format!(
                "expected start, got {other:?}"
            )));
        }
        Ok(Ok(None)) => return Err(AgentError::protocol("parent closed before start")),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(AgentError::protocol(format!(
                "no start within {}s",
                START_TIMEOUT.as_secs()
            )));
        }
    };

    let task_name = Path::new(task_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(task_path)
        .to_string();
    debug!(task = %task_name, req_id = %req.req_id, "worker starting");

    let ctx = TaskContext::new(tx.clone(), req.clone());

    match registry.get(&task_name) {
        None => {
            // The "module does not exist" case: exception, then the error
            // terminal protocol.
            let message = format!("no such task module: {task_name}");
            warn!(task = %task_name, "unknown task");
            let _ = tx.send(WorkerMessage::Exception {
                error: ExceptionInfo {
                    message: message.clone(),
                    stack: None,
                },
            });
            ctx.fatal(&message, None);
        }
        Some(task) => {
            let exec_ctx = ctx.clone();
            let params = req.params.clone();
            let mut exec = tokio::spawn(async move {
                if let Err(e) = task.pre_check(&params, &exec_ctx).await {
                    return Err(e);
                }
                if !task.steps().is_empty() {
                    exec_ctx.log_trace(format!("steps: {}", task.steps().join(", ")));
                }
                task.start(params, &exec_ctx).await
            });

            // Route relayed subtask results while the task runs.
            let result = loop {
                tokio::select! {
                    result = &mut exec => break result,
                    line = lines_in.next() => match line {
                        Some(Ok(line)) => route_parent_line(&ctx, &line),
                        Some(Err(e)) => {
                            warn!(error = %e, "unreadable parent record");
                        }
                        None => {
                            // Parent is gone; no one will relay subtask
                            // results or read our output.
                            debug!("parent channel closed; abandoning task");
                            exec.abort();
                            break Ok(Err(AgentError::worker("parent went away")));
                        }
                    }
                }
            };

            match result {
                Ok(Ok(value)) => ctx.finish(value),
                Ok(Err(e)) => ctx.fatal(&e.to_string(), None),
                Err(join_err) => {
                    let message = format!("task panicked: {join_err}");
                    let _ = tx.send(WorkerMessage::Exception {
                        error: ExceptionInfo {
                            message: message.clone(),
                            stack: None,
                        },
                    });
                    ctx.fatal(&message, Some(json!({"panic": true})));
                }
            }
        }
    }

    tx.send(WorkerMessage::Finish)
        .map_err(|_| AgentError::worker("writer closed before finish"))?;
    drop(tx);
    writer_task
        .await
        .map_err(|e| AgentError::worker(format!("writer task failed: {e}")))?;
    Ok(())
}

async fn read_parent<R>(
    lines: &mut FramedRead<R, LinesCodec>,
) -> AgentResult<Option<ParentMessage>>
where
    R: AsyncRead + Unpin,
{
    match lines.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(AgentError::protocol(format!("reading parent: {e}"))),
        Some(Ok(line)) => {
            let msg = serde_json::from_str(&line)
                .map_err(|e| AgentError::protocol(format!("parsing parent record: {e}")))?;
            Ok(Some(msg))
        }
    }
}

fn route_parent_line(ctx: &TaskContext, line: &str) {
    match serde_json::from_str::<ParentMessage>(line) {
        Ok(ParentMessage::SubtaskResult { id, name, event }) => {
            ctx.resolve_subtask(&id, SubtaskOutcome { name, event });
        }
        Ok(ParentMessage::Start { .. }) => {
            warn!("duplicate start record ignored");
        }
        Err(e) => warn!(error = %e, "unparseable parent record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_shared::protocol::TaskRequest;
    use serde_json::Value;

    type ParentPipe = (
        FramedWrite<tokio::io::DuplexStream, LinesCodec>,
        FramedRead<tokio::io::DuplexStream, LinesCodec>,
        tokio::task::JoinHandle<AgentResult<()>>,
    );

    /// Spawn the worker loop over in-memory pipes and complete the
    /// ready/start handshake.
    async fn handshake(task_name: &str, params: Value) -> ParentPipe {
        let (parent_in, child_in) = tokio::io::duplex(64 * 1024);
        let (child_out, parent_out) = tokio::io::duplex(64 * 1024);

        let task_path = format!("tasks/{task_name}");
        let worker = tokio::spawn(async move {
            let registry = TaskRegistry::builtin();
            run_on(&task_path, &registry, child_in, child_out).await
        });

        let mut writer = FramedWrite::new(parent_in, LinesCodec::new());
        let mut reader = FramedRead::new(parent_out, LinesCodec::new());

        let ready: WorkerMessage =
            serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(ready, WorkerMessage::Ready));

        let start = ParentMessage::Start {
            req: TaskRequest::new(task_name, params, Some("req-test".to_string())),
            taskspath: "tasks".to_string(),
        };
        writer
            .send(serde_json::to_string(&start).unwrap())
            .await
            .unwrap();

        (writer, reader, worker)
    }

    /// Collect worker records through the closing bare `finish`
    async fn collect(reader: &mut FramedRead<tokio::io::DuplexStream, LinesCodec>) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Some(Ok(line)) = reader.next().await {
            let msg: WorkerMessage = serde_json::from_str(&line).unwrap();
            let done = matches!(msg, WorkerMessage::Finish);
            messages.push(msg);
            if done {
                break;
            }
        }
        messages
    }

    fn event_names(messages: &[WorkerMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Event { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_nop_task_finishes_with_result() {
        let (_writer, mut reader, worker) = handshake("nop", serde_json::json!({})).await;
        let messages = collect(&mut reader).await;
        worker.await.unwrap().unwrap();

        assert_eq!(event_names(&messages), vec!["finish"]);
        match &messages[0] {
            WorkerMessage::Event { event, .. } => assert_eq!(event["ok"], true),
            other => panic!("Expected finish event, got {other:?}"),
        }
        assert!(matches!(messages.last(), Some(WorkerMessage::Finish)));
    }

    #[tokio::test]
    async fn test_echo_params_round_trips_payload() {
        let params = serde_json::json!({"alpha": 1, "nested": {"b": true}});
        let (_writer, mut reader, worker) = handshake("echo_params", params.clone()).await;
        let messages = collect(&mut reader).await;
        worker.await.unwrap().unwrap();

        match &messages[0] {
            WorkerMessage::Event { name, event, .. } => {
                assert_eq!(name, "finish");
                assert_eq!(event, &params);
            }
            other => panic!("Expected finish event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_task_emits_progress_error_finish_in_order() {
        let params = serde_json::json!({"error": {"code": "EBAD"}});
        let (_writer, mut reader, worker) = handshake("fail", params).await;
        let messages = collect(&mut reader).await;
        worker.await.unwrap().unwrap();

        assert_eq!(event_names(&messages), vec!["progress", "error", "finish"]);
        let error_event = messages
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Event { name, event, .. } if name == "error" => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error_event["code"], "EBAD");
    }

    #[tokio::test]
    async fn test_unknown_task_emits_exception_then_error_finish() {
        let (_writer, mut reader, worker) =
            handshake("does_not_exist", serde_json::json!({})).await;
        let messages = collect(&mut reader).await;
        worker.await.unwrap().unwrap();

        assert!(matches!(messages[0], WorkerMessage::Exception { .. }));
        assert_eq!(event_names(&messages), vec!["error", "finish"]);
    }

    #[tokio::test]
    async fn test_pre_check_failure_fails_without_side_effects() {
        // run_subtask demands params.task; an empty body must fail early.
        let (_writer, mut reader, worker) =
            handshake("run_subtask", serde_json::json!({})).await;
        let messages = collect(&mut reader).await;
        worker.await.unwrap().unwrap();
        assert_eq!(event_names(&messages), vec!["error", "finish"]);
    }

    #[tokio::test]
    async fn test_subtask_relay_round_trip() {
        let params = serde_json::json!({"task": "nop", "resource": "localhost"});
        let (mut writer, mut reader, worker) = handshake("run_subtask", params).await;

        // The worker asks for a nested task; play the parent and relay a
        // successful terminal event.
        let mut messages = Vec::new();
        loop {
            let line = reader.next().await.unwrap().unwrap();
            let msg: WorkerMessage = serde_json::from_str(&line).unwrap();
            match &msg {
                WorkerMessage::Subtask { id, task, .. } => {
                    assert_eq!(task, "nop");
                    let relay = ParentMessage::SubtaskResult {
                        id: id.clone(),
                        name: "finish".to_string(),
                        event: serde_json::json!({"ok": true}),
                    };
                    writer
                        .send(serde_json::to_string(&relay).unwrap())
                        .await
                        .unwrap();
                }
                WorkerMessage::Finish => {
                    messages.push(msg);
                    break;
                }
                _ => messages.push(msg),
            }
        }
        worker.await.unwrap().unwrap();

        let finish_event = messages
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Event { name, event, .. } if name == "finish" => {
                    Some(event.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(finish_event["subtask"], "nop");
        assert_eq!(finish_event["result"]["ok"], true);
    }

    #[tokio::test]
    async fn test_parent_silence_times_out() {
        tokio::time::pause();
        let (_parent_in, child_in) = tokio::io::duplex(1024);
        let (child_out, _parent_out) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            let registry = TaskRegistry::builtin();
            run_on("tasks/nop", &registry, child_in, child_out).await
        });
        tokio::time::advance(Duration::from_secs(31)).await;
        let result = worker.await.unwrap();
        assert!(result.is_err());
    }
}
