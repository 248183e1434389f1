//! # Linux Backend
//!
//! Serves a plain Linux host: no virtual machines, memory and boot time
//! from the `sysinfo` crate, pool stats approximated from mounted disks,
//! and the agent inventory from the install tree. The sysinfo document is
//! synthesized in the same shape the hypervisor platform produces so the
//! rest of the agent does not care which backend it runs on.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use agent_shared::config::{AgentConfig, SdcConfig};
use agent_shared::sample::{AgentEntry, DiskUsage, MemoryInfo, PoolStatus, Sysinfo, VmSummary};
use agent_shared::{AgentError, AgentResult};

use crate::{DirtyFn, NodeBackend};

const DEFAULT_AGENTS_ROOT: &str = "/opt/node-agent/agents";
const SDC_CONFIG_PATH: &str = "/etc/node-agent/sdc_config.json";

#[derive(Debug)]
pub struct LinuxBackend {
    config: AgentConfig,
    agents_root: PathBuf,
}

impl LinuxBackend {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            agents_root: PathBuf::from(DEFAULT_AGENTS_ROOT),
        }
    }

    pub fn with_agents_root(mut self, root: PathBuf) -> Self {
        self.agents_root = root;
        self
    }

    fn machine_uuid() -> String {
        match std::fs::read_to_string("/etc/machine-id") {
            Ok(raw) => match uuid::Uuid::parse_str(raw.trim()) {
                Ok(uuid) => uuid.to_string(),
                Err(_) => {
                    warn!("machine-id is not uuid-shaped; generating a transient server uuid");
                    uuid::Uuid::new_v4().to_string()
                }
            },
            Err(e) => {
                warn!(error = %e, "no /etc/machine-id; generating a transient server uuid");
                uuid::Uuid::new_v4().to_string()
            }
        }
    }

    fn interfaces() -> Map<String, Value> {
        let networks = sysinfo::Networks::new_with_refreshed_list();
        let mut nics = Map::new();
        let mut first = true;
        for (name, data) in networks.iter() {
            let ip4 = data.ip_networks().iter().find_map(|net| match net.addr {
                IpAddr::V4(v4) if !v4.is_loopback() => Some(v4.to_string()),
                _ => None,
            });
            let Some(ip4) = ip4 else { continue };
            // First routable interface doubles as the admin network.
            let names: Vec<&str> = if first { vec!["admin"] } else { vec![] };
            first = false;
            nics.insert(
                name.clone(),
                json!({"ip4addr": ip4, "NIC Names": names}),
            );
        }
        nics
    }
}

#[async_trait]
impl NodeBackend for LinuxBackend {
    fn agent_config(&self) -> &AgentConfig {
        &self.config
    }

    async fn get_sdc_config(&self) -> AgentResult<SdcConfig> {
        let bytes = tokio::fs::read(SDC_CONFIG_PATH).await.map_err(|e| {
            AgentError::config(format!("reading {SDC_CONFIG_PATH}: {e}"))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::config(format!("parsing {SDC_CONFIG_PATH}: {e}")))
    }

    async fn get_sysinfo(&self) -> AgentResult<Sysinfo> {
        let mut system = sysinfo::System::new();
        system.refresh_memory();

        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        Ok(json!({
            "UUID": Self::machine_uuid(),
            "Hostname": hostname,
            "System Type": "linux",
            "Live Image": sysinfo::System::kernel_version().unwrap_or_default(),
            "CPU Count": num_cpus(),
            "MiB of Memory": system.total_memory() / (1024 * 1024),
            "Boot Time": sysinfo::System::boot_time(),
            "Network Interfaces": Value::Object(Self::interfaces()),
        }))
    }

    async fn get_first_admin_ip(&self) -> AgentResult<String> {
        let sysinfo = self.get_sysinfo().await?;
        crate::first_admin_ip(&sysinfo)
    }

    async fn get_memory_info(&self) -> AgentResult<MemoryInfo> {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        Ok(MemoryInfo {
            availrmem_bytes: system.available_memory(),
            arcsize_bytes: 0,
            total_bytes: system.total_memory(),
        })
    }

    async fn get_zpool_info(&self) -> AgentResult<BTreeMap<String, PoolStatus>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut pools = BTreeMap::new();
        for disk in disks.iter() {
            let mount = disk.mount_point().to_string_lossy().to_string();
            let total = disk.total_space();
            let available = disk.available_space();
            pools.insert(
                mount,
                PoolStatus {
                    bytes_available: available,
                    bytes_used: total.saturating_sub(available),
                },
            );
        }
        Ok(pools)
    }

    async fn get_disk_usage(
        &self,
        _vms: &BTreeMap<String, VmSummary>,
    ) -> AgentResult<DiskUsage> {
        // No datasets on a plain Linux host; report the root filesystem as
        // the pool with everything charged to the system remainder.
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut usage = DiskUsage::default();
        for disk in disks.iter() {
            if disk.mount_point() == std::path::Path::new("/") {
                let total = disk.total_space();
                let available = disk.available_space();
                usage.pool_size_bytes = total;
                usage.pool_alloc_bytes = total.saturating_sub(available);
                usage.system_used_bytes = usage.pool_alloc_bytes as i64;
                break;
            }
        }
        Ok(usage)
    }

    async fn get_boot_time(&self) -> AgentResult<DateTime<Utc>> {
        DateTime::from_timestamp(sysinfo::System::boot_time() as i64, 0)
            .ok_or_else(|| AgentError::backend("boot time out of range"))
    }

    async fn load_vms(&self) -> AgentResult<BTreeMap<String, VmSummary>> {
        Ok(BTreeMap::new())
    }

    async fn get_agents(&self) -> AgentResult<Vec<AgentEntry>> {
        crate::read_agents_dir(&self.agents_root).await
    }

    async fn start_watchers(&self, _dirty: DirtyFn) -> AgentResult<()> {
        // Nothing changes underneath us that the 60 s resample would miss.
        Ok(())
    }

    async fn stop_watchers(&self) {}
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
