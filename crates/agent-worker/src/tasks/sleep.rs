//! Sleep task: idles for `params.seconds` (fractional allowed) and reports
//! how long it slept. Exists to exercise timeouts and queue concurrency.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct Sleep;

#[async_trait]
impl Task for Sleep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn start(&self, params: Value, ctx: &TaskContext) -> AgentResult<Value> {
        let seconds = params
            .get("seconds")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .max(0.0);
        ctx.log_info(format!("sleeping {seconds}s"));
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(json!({ "slept_seconds": seconds }))
    }
}
