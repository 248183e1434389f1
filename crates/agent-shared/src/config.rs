//! # Agent Configuration
//!
//! Configuration is read once at startup from three sources, layered in
//! order: compiled-in defaults, an optional TOML/JSON config file, and
//! `AGENT_`-prefixed environment variables. The sdc config (datacenter
//! identity) is a separate document supplied by the backend or a file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// Which backend implementation drives this agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Production hypervisor host (vmadm/zfs tooling)
    Hypervisor,
    /// Plain Linux host, no virtual machines
    #[default]
    Linux,
    /// Simulator reading per-server state from a directory tree
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Hypervisor => "hypervisor",
            BackendKind::Linux => "linux",
            BackendKind::Mock => "mock",
        }
    }
}

/// Controller (CNAPI) client settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CnapiConfig {
    /// Explicit controller URL; when unset the address is derived from the
    /// sdc config as `http://cnapi.<datacenter>.<dns_domain>`
    #[serde(default)]
    pub url: Option<String>,
}

/// Agent configuration, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Rabbit-transport compatibility flag. When false the agent refuses to
    /// serve: it logs and idles indefinitely without binding its socket.
    #[serde(default = "default_true")]
    pub no_rabbit: bool,

    /// Forwarded verbatim to workers via the environment
    #[serde(default)]
    pub fluentd_host: Option<String>,

    #[serde(default)]
    pub cnapi: CnapiConfig,

    /// Directory for per-task worker log files
    #[serde(default = "default_tasklogdir")]
    pub tasklogdir: PathBuf,

    /// Worker wall-clock timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default)]
    pub backend: BackendKind,

    /// Root of the simulated server tree for the mock backend
    #[serde(default)]
    pub simulation_root: Option<PathBuf>,

    /// Marks this instance as the update helper for its sibling agent:
    /// registration and sampling are skipped, only tasks are served.
    #[serde(default)]
    pub update_helper: bool,
}

fn default_true() -> bool {
    true
}

fn default_tasklogdir() -> PathBuf {
    PathBuf::from("/var/log/node-agent/logs")
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5309
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            no_rabbit: true,
            fluentd_host: None,
            cnapi: CnapiConfig::default(),
            tasklogdir: default_tasklogdir(),
            timeout_seconds: default_timeout_seconds(),
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            backend: BackendKind::default(),
            simulation_root: None,
            update_helper: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration: defaults, then the optional file at `path`, then
    /// `AGENT_`-prefixed environment variables (`AGENT_LISTEN_PORT=8080`,
    /// `AGENT_CNAPI__URL=...` for nested fields).
    pub fn load(path: Option<&std::path::Path>) -> AgentResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).required(false),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("AGENT")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .map_err(|e| AgentError::config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AgentError::config(e.to_string()))
    }
}

/// System-wide sdc config: datacenter identity used to derive service
/// addresses of the form `<service>.<datacenter>.<dns_domain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdcConfig {
    pub datacenter_name: String,
    pub dns_domain: String,
}

impl SdcConfig {
    /// Address of a datacenter service
    pub fn service_url(&self, service: &str) -> String {
        format!(
            "http://{}.{}.{}",
            service, self.datacenter_name, self.dns_domain
        )
    }
}
