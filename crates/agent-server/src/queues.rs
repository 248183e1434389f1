//! # Queue Registry
//!
//! Queues group task names into concurrency classes with shared logging
//! policy. The registry is installed once at startup; lookup is by task
//! name and every task name belongs to exactly one queue.
//!
//! Saturated queues make dispatches wait on the queue's semaphore rather
//! than rejecting them; the wait is logged so contention is visible.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use agent_shared::{AgentError, AgentResult};

/// Upper bound used for queues with no explicit concurrency limit
const UNBOUNDED_PERMITS: usize = Semaphore::MAX_PERMITS >> 3;

/// Static definition of one queue
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub name: String,
    pub tasks: BTreeSet<String>,
    /// In-flight worker cap; `None` is unbounded
    pub max_concurrent: Option<usize>,
    /// When false, request bodies are elided from dispatch logs
    pub log_params: bool,
    /// When false, dispatches log at debug only (high-frequency queries)
    pub logging: bool,
    /// Reject dispatches whose request age exceeds this many seconds
    pub expires: Option<u64>,
}

impl QueueDefinition {
    pub fn new(name: &str, tasks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            max_concurrent: None,
            log_params: true,
            logging: true,
            expires: None,
        }
    }

    pub fn serialized(mut self) -> Self {
        self.max_concurrent = Some(1);
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.logging = false;
        self
    }

    pub fn without_param_logging(mut self) -> Self {
        self.log_params = false;
        self
    }

    pub fn expires(mut self, seconds: u64) -> Self {
        self.expires = Some(seconds);
        self
    }
}

/// A registered queue: its definition plus the concurrency gate
#[derive(Debug)]
pub struct Queue {
    pub def: QueueDefinition,
    semaphore: Arc<Semaphore>,
}

impl Queue {
    fn new(def: QueueDefinition) -> Self {
        let permits = def.max_concurrent.unwrap_or(UNBOUNDED_PERMITS);
        Self {
            def,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Take an in-flight slot, waiting when the queue is saturated
    pub async fn acquire(&self, task: &str) -> OwnedSemaphorePermit {
        let semaphore = self.semaphore.clone();
        if semaphore.available_permits() == 0 {
            debug!(queue = %self.def.name, task = %task, "queue saturated; dispatch waiting");
        }
        semaphore
            .acquire_owned()
            .await
            .expect("queue semaphore closed")
    }

    /// In-flight workers currently admitted by this queue
    pub fn in_flight(&self) -> usize {
        let total = self.def.max_concurrent.unwrap_or(UNBOUNDED_PERMITS);
        total - self.semaphore.available_permits()
    }
}

/// Task name → queue lookup table
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: Vec<Arc<Queue>>,
    by_task: BTreeMap<String, usize>,
}

impl QueueRegistry {
    /// Build a registry, rejecting task names claimed by more than one queue
    pub fn new(definitions: Vec<QueueDefinition>) -> AgentResult<Self> {
        let mut queues = Vec::with_capacity(definitions.len());
        let mut by_task = BTreeMap::new();
        for def in definitions {
            let index = queues.len();
            for task in &def.tasks {
                if by_task.insert(task.clone(), index).is_some() {
                    return Err(AgentError::config(format!(
                        "task {task} registered in more than one queue"
                    )));
                }
            }
            queues.push(Arc::new(Queue::new(def)));
        }
        Ok(Self { queues, by_task })
    }

    /// The queue table the agent ships with
    pub fn with_defaults() -> AgentResult<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(vec![
            QueueDefinition::new("nop_tasks", &["nop", "sleep", "echo_params", "fail"])
                .expires(60),
            QueueDefinition::new("machine_queries", &["machine_list"]).quiet(),
            QueueDefinition::new("server_tasks", &["server_sysinfo"]).max_concurrent(cpus),
            // Compound tasks mutate through their children; keep them
            // strictly serialized.
            QueueDefinition::new("compound_tasks", &["run_subtask"]).serialized(),
        ])
    }

    pub fn lookup(&self, task: &str) -> Option<Arc<Queue>> {
        self.by_task.get(task).map(|&i| self.queues[i].clone())
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lookup_by_task_name() {
        let registry = QueueRegistry::with_defaults().unwrap();
        assert_eq!(registry.lookup("nop").unwrap().def.name, "nop_tasks");
        assert_eq!(
            registry.lookup("machine_list").unwrap().def.name,
            "machine_queries"
        );
        assert!(registry.lookup("unknown").is_none());
    }

    #[test]
    fn test_duplicate_task_names_rejected() {
        let result = QueueRegistry::new(vec![
            QueueDefinition::new("a", &["nop"]),
            QueueDefinition::new("b", &["nop"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_policies() {
        let registry = QueueRegistry::with_defaults().unwrap();
        let queries = registry.lookup("machine_list").unwrap();
        assert!(!queries.def.logging);
        let nop = registry.lookup("nop").unwrap();
        assert_eq!(nop.def.expires, Some(60));
    }

    #[tokio::test]
    async fn test_serialized_queue_admits_one_at_a_time() {
        let registry = QueueRegistry::new(vec![
            QueueDefinition::new("serial", &["t"]).serialized(),
        ])
        .unwrap();
        let queue = registry.lookup("t").unwrap();

        let first = queue.acquire("t").await;
        assert_eq!(queue.in_flight(), 1);

        // Second acquire parks until the first permit drops.
        let queue_clone = queue.clone();
        let second = tokio::spawn(async move { queue_clone.acquire("t").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(first);
        let _permit = second.await.unwrap();
        assert_eq!(queue.in_flight(), 1);
    }
}
