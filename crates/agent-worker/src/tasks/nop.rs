//! No-op task: succeeds immediately. Used for liveness checks and as the
//! smallest possible exercise of the dispatch pipeline.

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct Nop;

#[async_trait]
impl Task for Nop {
    fn name(&self) -> &'static str {
        "nop"
    }

    async fn start(&self, _params: Value, _ctx: &TaskContext) -> AgentResult<Value> {
        Ok(json!({ "ok": true }))
    }
}
