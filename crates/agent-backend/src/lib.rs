//! # Backend Capability Set
//!
//! The agent core never touches the host directly: everything it needs —
//! sysinfo, VM listings, pool and memory stats, disk usage, the agent
//! inventory, change watchers — comes through the [`NodeBackend`] trait.
//!
//! Three implementations ship with the agent:
//!
//! - [`hypervisor::HypervisorBackend`] drives a real virtualization host
//!   through its platform tooling (`vmadm`, `zfs`, `zpool`, `sysinfo`)
//! - [`linux::LinuxBackend`] serves a plain Linux host with no VMs
//! - [`mock::MockBackend`] reads simulated server state from a directory
//!   tree and is what the test suite runs against

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use agent_shared::config::{AgentConfig, BackendKind, SdcConfig};
use agent_shared::sample::{AgentEntry, DiskUsage, MemoryInfo, PoolStatus, Sysinfo, VmSummary};
use agent_shared::{AgentError, AgentResult};

pub mod disk_usage;
pub mod hypervisor;
pub mod linux;
pub mod mock;

/// Callback a watcher invokes when it observes a relevant system change
pub type DirtyFn = Arc<dyn Fn() + Send + Sync>;

/// Host capability set consumed by the agent core
#[async_trait]
pub trait NodeBackend: Send + Sync + std::fmt::Debug {
    /// The agent configuration this backend was constructed with
    fn agent_config(&self) -> &AgentConfig;

    /// Datacenter identity for deriving service addresses
    async fn get_sdc_config(&self) -> AgentResult<SdcConfig>;

    /// The host's sysinfo document (opaque to the core; the server UUID is
    /// read from its `UUID` key)
    async fn get_sysinfo(&self) -> AgentResult<Sysinfo>;

    /// Install a callback fired when sysinfo changes. Default: never fires.
    async fn watch_sysinfo(&self, _on_change: DirtyFn) -> AgentResult<()> {
        Ok(())
    }

    /// First IP bound to an admin-tagged interface; the address the agent
    /// listens on when no explicit listen_ip is configured
    async fn get_first_admin_ip(&self) -> AgentResult<String>;

    async fn get_memory_info(&self) -> AgentResult<MemoryInfo>;

    async fn get_zpool_info(&self) -> AgentResult<BTreeMap<String, PoolStatus>>;

    /// Disk-usage breakdown for the current VM set (see [`disk_usage`])
    async fn get_disk_usage(&self, vms: &BTreeMap<String, VmSummary>) -> AgentResult<DiskUsage>;

    async fn get_boot_time(&self) -> AgentResult<DateTime<Utc>>;

    /// VM listing restricted to the sampler's fixed field projection
    async fn load_vms(&self) -> AgentResult<BTreeMap<String, VmSummary>>;

    /// Installed agent inventory reported at controller registration
    async fn get_agents(&self) -> AgentResult<Vec<AgentEntry>>;

    /// Install change watchers that call `dirty` on relevant system events
    async fn start_watchers(&self, dirty: DirtyFn) -> AgentResult<()>;

    async fn stop_watchers(&self);

    /// Remove stale lock files left behind by a previous instance.
    /// Default: nothing to clean.
    async fn cleanup_stale_locks(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// Construct the backend selected by the agent configuration
pub fn make_backend(config: AgentConfig) -> AgentResult<Arc<dyn NodeBackend>> {
    match config.backend {
        BackendKind::Hypervisor => Ok(Arc::new(hypervisor::HypervisorBackend::new(config))),
        BackendKind::Linux => Ok(Arc::new(linux::LinuxBackend::new(config))),
        BackendKind::Mock => {
            let root = config.simulation_root.clone().ok_or_else(|| {
                AgentError::config("mock backend requires simulation_root")
            })?;
            // A simulation tree may hold several servers; this agent samples
            // and registers the first, the rest are served as task targets.
            let first = mock::MockBackend::list_servers(&root)?
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::config("simulation root has no servers"))?;
            Ok(Arc::new(mock::MockBackend::new(config, first)?))
        }
    }
}

/// Pull the first admin-tagged NIC address out of a sysinfo document.
/// Falls back to the first interface carrying any ip4 address.
pub fn first_admin_ip(sysinfo: &Value) -> AgentResult<String> {
    let nics = sysinfo
        .get("Network Interfaces")
        .and_then(Value::as_object)
        .ok_or_else(|| AgentError::backend("sysinfo has no Network Interfaces"))?;

    let ip_of = |nic: &Value| -> Option<String> {
        nic.get("ip4addr")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    for nic in nics.values() {
        let is_admin = nic
            .get("NIC Names")
            .and_then(Value::as_array)
            .is_some_and(|names| names.iter().any(|n| n.as_str() == Some("admin")));
        if is_admin {
            if let Some(ip) = ip_of(nic) {
                return Ok(ip);
            }
        }
    }
    for nic in nics.values() {
        if let Some(ip) = ip_of(nic) {
            return Ok(ip);
        }
    }
    Err(AgentError::backend("no usable NIC address in sysinfo"))
}

/// Read the installed-agent inventory from an install tree: one directory
/// per agent, each carrying a `manifest.json` with name, uuid, image_uuid
/// and version. Directories without a readable manifest are skipped.
pub(crate) async fn read_agents_dir(root: &std::path::Path) -> AgentResult<Vec<AgentEntry>> {
    let mut agents = Vec::new();
    if !root.is_dir() {
        return Ok(agents);
    }
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let manifest = entry.path().join("manifest.json");
        let Ok(bytes) = tokio::fs::read(&manifest).await else {
            continue;
        };
        match serde_json::from_slice::<AgentEntry>(&bytes) {
            Ok(agent) => agents.push(agent),
            Err(e) => {
                tracing::warn!(path = %manifest.display(), error = %e, "Skipping unreadable agent manifest");
            }
        }
    }
    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

/// Read the server UUID out of a sysinfo document
pub fn server_uuid(sysinfo: &Value) -> AgentResult<String> {
    sysinfo
        .get("UUID")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AgentError::backend("sysinfo has no UUID"))
}
