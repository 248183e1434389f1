//! Echo task: finishes with its own parameters as the result.

use async_trait::async_trait;
use serde_json::Value;

use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct EchoParams;

#[async_trait]
impl Task for EchoParams {
    fn name(&self) -> &'static str {
        "echo_params"
    }

    async fn start(&self, params: Value, _ctx: &TaskContext) -> AgentResult<Value> {
        Ok(params)
    }
}
