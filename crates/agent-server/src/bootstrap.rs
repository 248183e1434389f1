//! # Agent Bootstrap
//!
//! Wires the subsystems together: backend, per-server dispatchers, the
//! HTTP surface, controller registration, heartbeats, and the sampler.
//!
//! Startup order matters on the outbound side: the agent inventory is
//! posted before the heartbeat cadence starts, and sampling only begins
//! once the controller link is up. An update-helper instance skips
//! registration and sampling entirely and only serves tasks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use agent_backend::{mock::MockBackend, server_uuid, NodeBackend};
use agent_shared::config::{AgentConfig, BackendKind};
use agent_shared::{AgentError, AgentResult};

use crate::controller::{ControllerClient, ControllerLink};
use crate::dispatch::Dispatcher;
use crate::history::TaskHistory;
use crate::queues::QueueRegistry;
use crate::runner::{RunnerConfig, TaskRunner};
use crate::sampler::{self, SamplerConfig, SamplerHandle};
use crate::web::AppState;

/// Knobs the binary and the test harness hand to [`bootstrap`]
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub config: AgentConfig,
    /// Config file path, forwarded to workers
    pub config_path: Option<PathBuf>,
    /// Override the worker program (defaults to this executable's
    /// `worker` subcommand)
    pub worker_program: Option<PathBuf>,
    /// Override the sampler cadence
    pub sampler: Option<SamplerConfig>,
}

/// A running agent
pub struct AgentHandle {
    pub state: AppState,
    pub server_uuid: String,
    pub local_addr: SocketAddr,
    serve_task: JoinHandle<()>,
    controller_task: Option<JoinHandle<()>>,
    sampler: Option<SamplerHandle>,
    backend: Arc<dyn NodeBackend>,
}

impl AgentHandle {
    pub fn backend(&self) -> &Arc<dyn NodeBackend> {
        &self.backend
    }

    /// Tear the agent down: stop serving, sampling and posting.
    pub async fn stop(self) {
        self.serve_task.abort();
        if let Some(task) = self.controller_task {
            task.abort();
        }
        if let Some(sampler) = self.sampler {
            sampler.stop().await;
        }
        info!("agent stopped");
    }
}

/// Start the agent described by `options`.
pub async fn bootstrap(options: BootstrapOptions) -> AgentResult<AgentHandle> {
    let config = options.config.clone();

    if !config.no_rabbit {
        // Compatibility hold: a config that selects the retired transport
        // gets an agent that refuses to serve anything, probes included.
        error!("no_rabbit=false requests the retired transport; agent will idle indefinitely");
        std::future::pending::<()>().await;
        unreachable!();
    }

    let backend = agent_backend::make_backend(config.clone())?;
    if let Err(e) = backend.cleanup_stale_locks().await {
        warn!(error = %e, "stale lock cleanup failed");
    }

    let sysinfo = backend.get_sysinfo().await?;
    let uuid = server_uuid(&sysinfo)?;
    info!(server_uuid = %uuid, backend = ?config.backend, "starting agent");

    let primary = make_dispatcher(&options, &uuid)?;
    let state = AppState::new(primary);

    // A simulation tree can hold several servers; each extra server gets
    // its own dispatcher and history, selected by `x-server-uuid`.
    if config.backend == BackendKind::Mock {
        if let Some(root) = &config.simulation_root {
            for server_dir in MockBackend::list_servers(root)? {
                let sysinfo_path = server_dir.join("sysinfo.json");
                let bytes = std::fs::read(&sysinfo_path)?;
                let server_sysinfo: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| {
                        AgentError::config(format!("parsing {}: {e}", sysinfo_path.display()))
                    })?;
                let extra_uuid = server_uuid(&server_sysinfo)?;
                if extra_uuid != uuid {
                    state.add_server(make_dispatcher(&options, &extra_uuid)?);
                }
            }
        }
    }

    let listener = tokio::net::TcpListener::bind((config.listen_ip.as_str(), config.listen_port))
        .await
        .map_err(|e| {
            AgentError::config(format!(
                "binding {}:{}: {e}",
                config.listen_ip, config.listen_port
            ))
        })?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "task surface listening");

    let serve_state = state.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(e) = crate::web::serve(serve_state, listener).await {
            error!(error = %e, "http surface failed");
        }
    });

    let (controller_task, sampler_handle) = if config.update_helper {
        info!("update helper instance; skipping registration and sampling");
        (None, None)
    } else {
        let controller_url = match &config.cnapi.url {
            Some(url) => url.clone(),
            None => backend.get_sdc_config().await?.service_url("cnapi"),
        };
        info!(url = %controller_url, "controller resolved");
        let client = ControllerClient::new(controller_url, uuid.clone())?;
        let (link, controller_task) = ControllerLink::start(client);

        // Inventory first, then the heartbeat cadence.
        link.post_agents(backend.get_agents().await?);
        link.start_heartbeats();
        link.send_sysinfo(sysinfo).await;

        // A sysinfo change re-registers with the latest document.
        let sysinfo_link = link.clone();
        let sysinfo_backend = backend.clone();
        backend
            .watch_sysinfo(Arc::new(move || {
                let link = sysinfo_link.clone();
                let backend = sysinfo_backend.clone();
                tokio::spawn(async move {
                    match backend.get_sysinfo().await {
                        Ok(sysinfo) => link.send_sysinfo(sysinfo).await,
                        Err(e) => warn!(error = %e, "failed to reload changed sysinfo"),
                    }
                });
            }))
            .await?;

        let publish_link = link.clone();
        let sampler_handle = sampler::start(
            backend.clone(),
            options.sampler.clone().unwrap_or_default(),
            Arc::new(move |snapshot| {
                sampler::log_sample(&snapshot);
                let link = publish_link.clone();
                tokio::spawn(async move {
                    link.send_status(snapshot).await;
                });
            }),
        )
        .await?;

        (Some(controller_task), Some(sampler_handle))
    };

    Ok(AgentHandle {
        state,
        server_uuid: uuid,
        local_addr,
        serve_task,
        controller_task,
        sampler: sampler_handle,
        backend,
    })
}

fn make_dispatcher(options: &BootstrapOptions, server_uuid: &str) -> AgentResult<Dispatcher> {
    let mut runner_config =
        RunnerConfig::from_agent_config(&options.config, options.config_path.clone());
    if let Some(program) = &options.worker_program {
        runner_config.worker_program = program.clone();
    }
    let runner = TaskRunner::new(runner_config, TaskHistory::new());
    let queues = QueueRegistry::with_defaults()?;
    Ok(Dispatcher::new(runner, queues, server_uuid.to_string()))
}
