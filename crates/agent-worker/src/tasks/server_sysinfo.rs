//! Sysinfo query task: returns the host's sysinfo document through the
//! backend selected by the agent configuration.

use async_trait::async_trait;
use serde_json::Value;

use agent_shared::config::AgentConfig;
use agent_shared::AgentResult;

use crate::context::TaskContext;
use crate::tasks::Task;

pub struct ServerSysinfo;

#[async_trait]
impl Task for ServerSysinfo {
    fn name(&self) -> &'static str {
        "server_sysinfo"
    }

    async fn start(&self, _params: Value, ctx: &TaskContext) -> AgentResult<Value> {
        ctx.log_trace("loading sysinfo");
        let config = AgentConfig::load(config_path().as_deref())?;
        let backend = agent_backend::make_backend(config)?;
        backend.get_sysinfo().await
    }
}

/// Workers inherit the agent's config file path through the environment
pub(crate) fn config_path() -> Option<std::path::PathBuf> {
    std::env::var_os("AGENT_CONFIG_PATH").map(std::path::PathBuf::from)
}
