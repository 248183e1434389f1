//! # node-agent
//!
//! The compute-node agent binary. `node-agent run` (the default) starts
//! the agent; `node-agent worker <task_path>` is the child-process entry
//! the runner forks for each task.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use agent_server::bootstrap::{bootstrap, BootstrapOptions};
use agent_shared::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "node-agent", version, about = "Compute-node agent")]
struct Cli {
    /// Agent config file (TOML); environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent (default)
    Run,
    /// Worker child entry: run one task against the parent protocol
    Worker {
        /// Task module path; the final component names the task
        task_path: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Worker { task_path } => {
            // Stdout carries the worker protocol; logs go to stderr.
            agent_shared::logging::init_tracing_stderr();
            let registry = agent_worker::tasks::TaskRegistry::builtin();
            if let Err(e) = agent_worker::runtime::run(&task_path, &registry).await {
                error!(error = %e, task_path = %task_path, "worker failed");
                std::process::exit(1);
            }
        }
        Command::Run => {
            agent_shared::logging::init_tracing();
            if let Err(e) = run_agent(cli.config).await {
                error!(error = %e, "agent failed");
                std::process::exit(1);
            }
        }
    }
}

async fn run_agent(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting node-agent...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load(config_path.as_deref())?;
    let handle = bootstrap(BootstrapOptions {
        config,
        config_path,
        worker_program: None,
        sampler: None,
    })
    .await?;

    info!(addr = %handle.local_addr, server_uuid = %handle.server_uuid, "node-agent started");
    info!("   Press Ctrl+C to shut down");

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    match tokio::time::timeout(Duration::from_secs(30), handle.stop()).await {
        Ok(()) => info!("node-agent shutdown complete"),
        Err(_) => error!("graceful shutdown timed out, forcing exit"),
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
