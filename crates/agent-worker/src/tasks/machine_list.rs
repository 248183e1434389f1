//! Machine query task: lists the machines the backend knows about, keyed
//! by uuid.

use async_trait::async_trait;
use serde_json::Value;

use agent_shared::config::AgentConfig;
use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct MachineList;

#[async_trait]
impl Task for MachineList {
    fn name(&self) -> &'static str {
        "machine_list"
    }

    async fn start(&self, _params: Value, ctx: &TaskContext) -> AgentResult<Value> {
        ctx.log_trace("listing machines");
        let config = AgentConfig::load(super::server_sysinfo::config_path().as_deref())?;
        let backend = agent_backend::make_backend(config)?;
        let vms = backend.load_vms().await?;
        Ok(serde_json::to_value(vms)?)
    }
}
