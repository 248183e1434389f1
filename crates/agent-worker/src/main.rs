//! # agent-worker
//!
//! Child-process entry point. The runner invokes this binary with one
//! positional argument, `taskspath/<task>`, wires stdin/stdout to the
//! worker protocol, and supervises from the other side.

use clap::Parser;
use tracing::error;

use agent_worker::runtime;
use agent_worker::tasks::TaskRegistry;

#[derive(Parser, Debug)]
#[command(name = "agent-worker", about = "Run one compute-node agent task")]
struct Args {
    /// Task module path: the final component names the task
    task_path: String,
}

#[tokio::main]
async fn main() {
    // Stdout carries the protocol; logs go to stderr.
    agent_shared::logging::init_tracing_stderr();

    let args = Args::parse();
    let registry = TaskRegistry::builtin();

    if let Err(e) = runtime::run(&args.task_path, &registry).await {
        error!(error = %e, task_path = %args.task_path, "worker failed");
        std::process::exit(1);
    }
}
