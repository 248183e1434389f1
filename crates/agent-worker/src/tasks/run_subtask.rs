//! Subtask driver: runs a nested task through the parent and finishes with
//! the nested task's terminal event. Params: `{resource?, task, params?}`.

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_shared::{AgentError, AgentResult};

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct RunSubtask;

#[async_trait]
impl Task for RunSubtask {
    fn name(&self) -> &'static str {
        "run_subtask"
    }

    async fn pre_check(&self, params: &Value, _ctx: &TaskContext) -> AgentResult<()> {
        if params.get("task").and_then(Value::as_str).is_none() {
            return Err(AgentError::worker("run_subtask requires params.task"));
        }
        Ok(())
    }

    async fn start(&self, params: Value, ctx: &TaskContext) -> AgentResult<Value> {
        let task = params
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::worker("run_subtask requires params.task"))?;
        let resource = params
            .get("resource")
            .and_then(Value::as_str)
            .unwrap_or("localhost");
        let sub_params = params.get("params").cloned().unwrap_or_else(|| json!({}));

        ctx.log_info(format!("running subtask {task} on {resource}"));
        let outcome = ctx.subtask(resource, task, sub_params).await?;
        if outcome.succeeded() {
            Ok(json!({ "subtask": task, "result": outcome.event }))
        } else {
            Err(AgentError::worker(format!(
                "subtask {task} failed: {}",
                outcome.event
            )))
        }
    }
}
