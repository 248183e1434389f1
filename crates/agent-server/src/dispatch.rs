//! # Dispatch Layer
//!
//! Binds an accepted task request to a runner invocation: queue lookup,
//! expiry enforcement, concurrency admission, dispatch logging policy, and
//! reduction of the worker outcome to an HTTP-shaped result. Also routes
//! workers' nested subtasks back into the queues.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use agent_shared::protocol::{TaskRequest, EVENT_ERROR, EVENT_FINISH};

use crate::history::TaskHistory;
use crate::queues::QueueRegistry;
use crate::runner::{SubtaskRouter, TaskRunner};

/// Outcome of one dispatch, ready to be mapped onto an HTTP response
#[derive(Debug, Clone)]
pub enum DispatchResult {
    /// Worker finished; the payload is the task result (HTTP 200)
    Finished(Value),
    /// Worker reported or suffered an error (HTTP 500)
    Failed(Value),
    /// No queue owns this task name (HTTP 404)
    UnknownTask(String),
    /// The request outlived its queue's expiry window
    Expired(String),
}

#[derive(Debug)]
struct Inner {
    runner: TaskRunner,
    queues: QueueRegistry,
    /// UUID of the server this dispatcher serves; subtask resources naming
    /// it (or "localhost") stay local, anything else is refused.
    server_uuid: String,
}

/// Per-server task dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(runner: TaskRunner, queues: QueueRegistry, server_uuid: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                queues,
                server_uuid,
            }),
        }
    }

    pub fn history(&self) -> &TaskHistory {
        self.inner.runner.history()
    }

    pub fn server_uuid(&self) -> &str {
        &self.inner.server_uuid
    }

    pub async fn dispatch(&self, req: TaskRequest) -> DispatchResult {
        self.dispatch_chained(req, Vec::new()).await
    }

    async fn dispatch_chained(&self, req: TaskRequest, ancestry: Vec<String>) -> DispatchResult {
        let Some(queue) = self.inner.queues.lookup(&req.task) else {
            warn!(task = %req.task, "dispatch for unknown task");
            return DispatchResult::UnknownTask(req.task);
        };

        if let Some(expires) = queue.def.expires {
            let age = req.age_secs();
            if age > expires {
                warn!(
                    task = %req.task,
                    queue = %queue.def.name,
                    age_secs = age,
                    expires_secs = expires,
                    "Task expired"
                );
                return DispatchResult::Expired(req.task);
            }
        }

        if queue.def.logging {
            if queue.def.log_params {
                info!(
                    task = %req.task,
                    queue = %queue.def.name,
                    req_id = %req.req_id,
                    params = %req.params,
                    "dispatching task"
                );
            } else {
                info!(
                    task = %req.task,
                    queue = %queue.def.name,
                    req_id = %req.req_id,
                    "dispatching task (params elided)"
                );
            }
        } else {
            debug!(task = %req.task, req_id = %req.req_id, "dispatching query task");
        }

        let _permit = queue.acquire(&req.task).await;

        let router: Arc<dyn SubtaskRouter> = Arc::new(self.clone());
        match self.inner.runner.run(req, &ancestry, router).await {
            Ok(outcome) => match outcome.result {
                Ok(value) => DispatchResult::Finished(value),
                Err(error) => DispatchResult::Failed(error),
            },
            Err(e) => {
                warn!(error = %e, "runner failed before worker completion");
                DispatchResult::Failed(json!({ "error": e.to_string() }))
            }
        }
    }

    /// A nested dispatch into a serialized queue an ancestor already holds
    /// would park forever on the ancestor's own permit.
    fn would_deadlock(&self, ancestry: &[String], task: &str) -> bool {
        let Some(target) = self.inner.queues.lookup(task) else {
            return false;
        };
        if target.def.max_concurrent != Some(1) {
            return false;
        }
        ancestry.iter().any(|ancestor| {
            self.inner
                .queues
                .lookup(ancestor)
                .is_some_and(|q| q.def.name == target.def.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TaskHistory;
    use crate::queues::QueueDefinition;
    use crate::runner::{RunnerConfig, TaskRunner};
    use agent_shared::config::AgentConfig;

    const SERVER: &str = "11111111-2222-3333-4444-555555555555";

    fn dispatcher(defs: Vec<QueueDefinition>) -> Dispatcher {
        let config = AgentConfig::default();
        let runner = TaskRunner::new(
            RunnerConfig::from_agent_config(&config, None),
            TaskHistory::new(),
        );
        Dispatcher::new(runner, QueueRegistry::new(defs).unwrap(), SERVER.to_string())
    }

    #[tokio::test]
    async fn test_unknown_task_rejected_before_fork() {
        let d = dispatcher(vec![QueueDefinition::new("q", &["known"])]);
        let req = TaskRequest::new("mystery", json!({}), None);
        assert!(matches!(
            d.dispatch(req).await,
            DispatchResult::UnknownTask(t) if t == "mystery"
        ));
    }

    #[tokio::test]
    async fn test_expired_request_rejected_before_fork() {
        let d = dispatcher(vec![QueueDefinition::new("q", &["old"]).expires(1)]);
        let mut req = TaskRequest::new("old", json!({}), None);
        req.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        assert!(matches!(d.dispatch(req).await, DispatchResult::Expired(_)));
        assert!(d.history().is_empty());
    }

    #[tokio::test]
    async fn test_subtask_refuses_foreign_resource() {
        let d = dispatcher(vec![QueueDefinition::new("q", &["t"])]);
        let (name, event) = d
            .run_subtask(
                vec![],
                "some-other-server".to_string(),
                "t".to_string(),
                json!({}),
            )
            .await;
        assert_eq!(name, EVENT_ERROR);
        assert!(event["error"].as_str().unwrap().contains("not served here"));
    }

    #[tokio::test]
    async fn test_subtask_refuses_serialized_queue_reentry() {
        let d = dispatcher(vec![
            QueueDefinition::new("serial", &["a", "b"]).serialized(),
        ]);
        // An ancestor in "serial" still holds its permit; a nested "b"
        // would park forever.
        let (name, event) = d
            .run_subtask(
                vec!["a".to_string()],
                "localhost".to_string(),
                "b".to_string(),
                json!({}),
            )
            .await;
        assert_eq!(name, EVENT_ERROR);
        assert!(event["error"].as_str().unwrap().contains("deadlock"));
    }

    #[tokio::test]
    async fn test_subtask_unknown_task_is_error_event() {
        let d = dispatcher(vec![QueueDefinition::new("q", &["t"])]);
        let (name, event) = d
            .run_subtask(vec![], "localhost".to_string(), "nope".to_string(), json!({}))
            .await;
        assert_eq!(name, EVENT_ERROR);
        assert!(event["error"].as_str().unwrap().contains("no such task"));
    }
}

#[async_trait]
impl SubtaskRouter for Dispatcher {
    async fn run_subtask(
        &self,
        ancestry: Vec<String>,
        resource: String,
        task: String,
        params: Value,
    ) -> (String, Value) {
        let local = resource == "localhost"
            || resource.is_empty()
            || resource == self.inner.server_uuid;
        if !local {
            return (
                EVENT_ERROR.to_string(),
                json!({ "error": format!("subtask resource {resource} is not served here") }),
            );
        }
        if self.would_deadlock(&ancestry, &task) {
            warn!(task = %task, "subtask would deadlock its serialized queue");
            return (
                EVENT_ERROR.to_string(),
                json!({ "error": format!("subtask {task} would deadlock its queue") }),
            );
        }

        let req = TaskRequest::new(task, params, None);
        match self.dispatch_chained(req, ancestry).await {
            DispatchResult::Finished(value) => (EVENT_FINISH.to_string(), value),
            DispatchResult::Failed(error) => (EVENT_ERROR.to_string(), error),
            DispatchResult::UnknownTask(task) => (
                EVENT_ERROR.to_string(),
                json!({ "error": format!("no such task: {task}") }),
            ),
            DispatchResult::Expired(task) => (
                EVENT_ERROR.to_string(),
                json!({ "error": format!("subtask {task} expired before dispatch") }),
            ),
        }
    }
}
