//! # Task Modules
//!
//! Tasks are pluggable units of work the controller can dispatch. Each one
//! implements [`Task`] and registers in the [`TaskRegistry`] the worker
//! binary is compiled with; the runner addresses them by name through the
//! `taskspath/<task>` convention.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use agent_shared::AgentResult;

use crate::context::TaskContext;

mod echo_params;
mod fail;
mod machine_list;
mod nop;
mod run_subtask;
mod server_sysinfo;
mod sleep;

/// One task implementation.
///
/// `start` returns the task result; an `Err` is translated by the runtime
/// into an error event followed by a finish event. A task may instead drive
/// the terminal protocol itself through `ctx.finish` / `ctx.fatal`, in
/// which case the returned value is ignored.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordered step names, used only for progress and audit logging
    fn steps(&self) -> &'static [&'static str] {
        &[]
    }

    /// Optional validation pass run before `start`; a failure here fails
    /// the task without side effects.
    async fn pre_check(&self, _params: &Value, _ctx: &TaskContext) -> AgentResult<()> {
        Ok(())
    }

    async fn start(&self, params: Value, ctx: &TaskContext) -> AgentResult<Value>;
}

/// Name → implementation table compiled into the worker
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full task set shipped with the agent
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(nop::Nop));
        registry.register(Arc::new(sleep::Sleep));
        registry.register(Arc::new(echo_params::EchoParams));
        registry.register(Arc::new(fail::Fail));
        registry.register(Arc::new(run_subtask::RunSubtask));
        registry.register(Arc::new(server_sysinfo::ServerSysinfo));
        registry.register(Arc::new(machine_list::MachineList));
        registry
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name(), task);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
