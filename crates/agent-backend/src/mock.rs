//! # Mock Backend
//!
//! Serves one simulated server from a directory tree. The layout mirrors
//! what the simulator writes and what the integration tests assemble:
//!
//! ```text
//! <server dir>/
//!   sysinfo.json        # required; carries UUID and Network Interfaces
//!   sdc_config.json     # datacenter identity (optional)
//!   memory.json         # MemoryInfo (optional)
//!   zpools.json         # {pool: {bytes_available, bytes_used}} (optional)
//!   datasets.json       # [Dataset] (optional)
//!   images.json         # [installed image uuid] (optional)
//!   agents.json         # [AgentEntry] (optional)
//!   vms/<uuid>.json     # VmSummary records (optional)
//! ```
//!
//! Watchers poll the tree's modification times and mark the sampler dirty
//! whenever anything changes.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use agent_shared::config::{AgentConfig, SdcConfig};
use agent_shared::sample::{AgentEntry, DiskUsage, MemoryInfo, PoolStatus, Sysinfo, VmSummary};
use agent_shared::{AgentError, AgentResult};

use crate::disk_usage::{compute_disk_usage, Dataset};
use crate::{first_admin_ip, DirtyFn, NodeBackend};

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct MockBackend {
    config: AgentConfig,
    root: PathBuf,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl MockBackend {
    /// `root` is the server directory itself (it must hold `sysinfo.json`).
    pub fn new(config: AgentConfig, root: PathBuf) -> AgentResult<Self> {
        if !root.join("sysinfo.json").exists() {
            return Err(AgentError::config(format!(
                "simulation root {} has no sysinfo.json",
                root.display()
            )));
        }
        Ok(Self {
            config,
            root,
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Server directories available under a simulation tree root
    pub fn list_servers(tree_root: &Path) -> AgentResult<Vec<PathBuf>> {
        let servers = tree_root.join("servers");
        if !servers.is_dir() {
            return Ok(vec![tree_root.to_path_buf()]);
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&servers)? {
            let path = entry?.path();
            if path.join("sysinfo.json").is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> AgentResult<T> {
        let path = self.root.join(name);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            AgentError::backend(format!("reading {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::backend(format!("parsing {}: {e}", path.display())))
    }

    async fn read_json_or<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        default: T,
    ) -> AgentResult<T> {
        if self.root.join(name).exists() {
            self.read_json(name).await
        } else {
            Ok(default)
        }
    }

    fn newest_mtime(root: &Path) -> SystemTime {
        fn walk(dir: &Path, newest: &mut SystemTime) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if let Ok(meta) = entry.metadata() {
                    if let Ok(mtime) = meta.modified() {
                        if mtime > *newest {
                            *newest = mtime;
                        }
                    }
                    if meta.is_dir() {
                        walk(&path, newest);
                    }
                }
            }
        }
        let mut newest = SystemTime::UNIX_EPOCH;
        walk(root, &mut newest);
        newest
    }

    /// Spawn a poll loop that fires `on_change` when anything under `path`
    /// is modified.
    fn spawn_mtime_watcher(path: PathBuf, on_change: DirtyFn) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = Self::newest_mtime(&path);
            let mut tick = tokio::time::interval(WATCH_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = Self::newest_mtime(&path);
                if now > last {
                    last = now;
                    debug!(path = %path.display(), "simulated server state changed");
                    on_change();
                }
            }
        })
    }
}

#[async_trait]
impl NodeBackend for MockBackend {
    fn agent_config(&self) -> &AgentConfig {
        &self.config
    }

    async fn get_sdc_config(&self) -> AgentResult<SdcConfig> {
        self.read_json_or(
            "sdc_config.json",
            SdcConfig {
                datacenter_name: "simdc".to_string(),
                dns_domain: "local".to_string(),
            },
        )
        .await
    }

    async fn get_sysinfo(&self) -> AgentResult<Sysinfo> {
        self.read_json("sysinfo.json").await
    }

    async fn watch_sysinfo(&self, on_change: DirtyFn) -> AgentResult<()> {
        let handle = Self::spawn_mtime_watcher(self.root.join("sysinfo.json"), on_change);
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn get_first_admin_ip(&self) -> AgentResult<String> {
        let sysinfo = self.get_sysinfo().await?;
        first_admin_ip(&sysinfo)
    }

    async fn get_memory_info(&self) -> AgentResult<MemoryInfo> {
        self.read_json_or(
            "memory.json",
            MemoryInfo {
                availrmem_bytes: 0,
                arcsize_bytes: 0,
                total_bytes: 0,
            },
        )
        .await
    }

    async fn get_zpool_info(&self) -> AgentResult<BTreeMap<String, PoolStatus>> {
        self.read_json_or("zpools.json", BTreeMap::new()).await
    }

    async fn get_disk_usage(
        &self,
        vms: &BTreeMap<String, VmSummary>,
    ) -> AgentResult<DiskUsage> {
        let datasets: Vec<Dataset> = self.read_json_or("datasets.json", Vec::new()).await?;
        let images: HashSet<String> = self
            .read_json_or("images.json", Vec::<String>::new())
            .await?
            .into_iter()
            .collect();
        Ok(compute_disk_usage(vms, &datasets, &images))
    }

    async fn get_boot_time(&self) -> AgentResult<DateTime<Utc>> {
        let sysinfo = self.get_sysinfo().await?;
        if let Some(secs) = sysinfo.get("Boot Time").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        }) {
            return DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| AgentError::backend("Boot Time out of range"));
        }
        Ok(Utc::now())
    }

    async fn load_vms(&self) -> AgentResult<BTreeMap<String, VmSummary>> {
        let vms_dir = self.root.join("vms");
        let mut vms = BTreeMap::new();
        if !vms_dir.is_dir() {
            return Ok(vms);
        }
        let mut entries = tokio::fs::read_dir(&vms_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let vm: VmSummary = serde_json::from_slice(&bytes).map_err(|e| {
                AgentError::backend(format!("parsing {}: {e}", path.display()))
            })?;
            vms.insert(vm.uuid.clone(), vm);
        }
        Ok(vms)
    }

    async fn get_agents(&self) -> AgentResult<Vec<AgentEntry>> {
        self.read_json_or("agents.json", Vec::new()).await
    }

    async fn start_watchers(&self, dirty: DirtyFn) -> AgentResult<()> {
        let handle = Self::spawn_mtime_watcher(self.root.clone(), dirty);
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn stop_watchers(&self) {
        for handle in self.watchers.lock().await.drain(..) {
            handle.abort();
        }
    }
}
