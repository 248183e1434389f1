//! Failing task: reports partial progress, then fails with the payload
//! given in `params.error` (default `{code: "EFAIL"}`). The diagnostic
//! counterpart to `nop` for the error half of the dispatch pipeline.

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct Fail;

#[async_trait]
impl Task for Fail {
    fn name(&self) -> &'static str {
        "fail"
    }

    fn steps(&self) -> &'static [&'static str] {
        &["report_progress", "fail"]
    }

    async fn start(&self, params: Value, ctx: &TaskContext) -> AgentResult<Value> {
        ctx.progress(50);
        let payload = params
            .get("error")
            .cloned()
            .unwrap_or_else(|| json!({ "code": "EFAIL" }));
        ctx.emit_event("error", payload);
        ctx.finish(json!({}));
        Ok(json!({}))
    }
}
