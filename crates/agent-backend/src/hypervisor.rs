//! # Hypervisor Backend
//!
//! Drives a real virtualization host through its platform tooling:
//! `vmadm` for machine listings, `zfs`/`zpool` for datasets and pools,
//! `sysinfo` for the host document, `kstat` for memory and boot time, and
//! `imgadm` for the installed-image set. Every capability is a short-lived
//! child process whose output is parsed here; the parsers are pure
//! functions so they can be tested without the tooling present.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use agent_shared::config::{AgentConfig, SdcConfig};
use agent_shared::sample::{AgentEntry, DiskUsage, MemoryInfo, PoolStatus, Sysinfo, VmSummary};
use agent_shared::{AgentError, AgentResult};

use crate::disk_usage::{compute_disk_usage, parse_zfs_list_line, Dataset};
use crate::{DirtyFn, NodeBackend};

const VM_FIELDS: &str =
    "uuid,owner_uuid,quota,max_physical_memory,zone_state,state,brand,cpu_cap,last_modified";
const ZONES_INDEX: &str = "/etc/zones/index";
const AGENTS_ROOT: &str = "/opt/node-agent/agents";
const SDC_CONFIG_PATH: &str = "/usbkey/config.json";
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct HypervisorBackend {
    config: AgentConfig,
    agents_root: PathBuf,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl HypervisorBackend {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            agents_root: PathBuf::from(AGENTS_ROOT),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Run a platform command and return its stdout, failing on a non-zero
    /// exit with the tool's stderr in the message.
    async fn run(program: &str, args: &[&str]) -> AgentResult<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::backend(format!("spawning {program}: {e}")))?;
        if !output.status.success() {
            return Err(AgentError::backend(format!(
                "{program} {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn kstat_value(stat: &str) -> AgentResult<u64> {
        let out = Self::run("kstat", &["-p", stat]).await?;
        parse_kstat_value(&out)
            .ok_or_else(|| AgentError::backend(format!("unparseable kstat output for {stat}")))
    }

    async fn page_size() -> AgentResult<u64> {
        let out = Self::run("getconf", &["PAGESIZE"]).await?;
        out.trim()
            .parse()
            .map_err(|_| AgentError::backend("unparseable PAGESIZE"))
    }

    async fn list_datasets() -> AgentResult<Vec<Dataset>> {
        let out = Self::run(
            "zfs",
            &[
                "list",
                "-Hpo",
                "name,used,avail,quota,volsize,type",
                "-t",
                "filesystem,volume",
            ],
        )
        .await?;
        Ok(out.lines().filter_map(parse_zfs_list_line).collect())
    }

    async fn installed_images() -> AgentResult<HashSet<String>> {
        let out = Self::run("imgadm", &["list", "-j"]).await?;
        let entries: Vec<Value> = serde_json::from_str(&out)
            .map_err(|e| AgentError::backend(format!("parsing imgadm list: {e}")))?;
        Ok(confirmed_image_uuids(&entries))
    }
}

/// Parse `kstat -p` output: `module:inst:name:stat<TAB>value`
fn parse_kstat_value(output: &str) -> Option<u64> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}

/// Image uuids whose manifests are more than a trivial stub
fn confirmed_image_uuids(entries: &[Value]) -> HashSet<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let manifest = entry.get("manifest")?;
            let uuid = manifest.get("uuid")?.as_str()?;
            let files_present = manifest
                .get("files")
                .and_then(Value::as_array)
                .is_some_and(|f| !f.is_empty());
            let substantial = manifest.as_object().is_some_and(|m| m.len() > 3);
            if files_present || substantial {
                Some(uuid.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Parse `zpool list -Hpo name,size,alloc` lines
fn parse_zpool_list(output: &str) -> BTreeMap<String, PoolStatus> {
    let mut pools = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(name), Some(size), Some(alloc)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let (Ok(size), Ok(alloc)) = (size.parse::<u64>(), alloc.parse::<u64>()) else {
            continue;
        };
        pools.insert(
            name.to_string(),
            PoolStatus {
                bytes_available: size.saturating_sub(alloc),
                bytes_used: alloc,
            },
        );
    }
    pools
}

#[async_trait]
impl NodeBackend for HypervisorBackend {
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
        let out = Self::run("sysinfo", &[]).await?;
        serde_json::from_str(&out)
            .map_err(|e| AgentError::backend(format!("parsing sysinfo output: {e}")))
    }

    async fn get_first_admin_ip(&self) -> AgentResult<String> {
        let sysinfo = self.get_sysinfo().await?;
        crate::first_admin_ip(&sysinfo)
    }

    async fn get_memory_info(&self) -> AgentResult<MemoryInfo> {
        let page_size = Self::page_size().await?;
        let availrmem_pages = Self::kstat_value("unix:0:system_pages:availrmem").await?;
        let total_pages = Self::kstat_value("unix:0:system_pages:physmem").await?;
        let arcsize = Self::kstat_value("zfs:0:arcstats:size").await?;
        Ok(MemoryInfo {
            availrmem_bytes: availrmem_pages * page_size,
            arcsize_bytes: arcsize,
            total_bytes: total_pages * page_size,
        })
    }

    async fn get_zpool_info(&self) -> AgentResult<BTreeMap<String, PoolStatus>> {
        let out = Self::run("zpool", &["list", "-Hpo", "name,size,alloc"]).await?;
        Ok(parse_zpool_list(&out))
    }

    async fn get_disk_usage(
        &self,
        vms: &BTreeMap<String, VmSummary>,
    ) -> AgentResult<DiskUsage> {
        let datasets = Self::list_datasets().await?;
        let images = Self::installed_images().await?;
        Ok(compute_disk_usage(vms, &datasets, &images))
    }

    async fn get_boot_time(&self) -> AgentResult<DateTime<Utc>> {
        let secs = Self::kstat_value("unix:0:system_misc:boot_time").await?;
        DateTime::from_timestamp(secs as i64, 0)
            .ok_or_else(|| AgentError::backend("boot_time kstat out of range"))
    }

    async fn load_vms(&self) -> AgentResult<BTreeMap<String, VmSummary>> {
        let out = Self::run("vmadm", &["lookup", "-j", "-o", VM_FIELDS]).await?;
        let vms: Vec<VmSummary> = serde_json::from_str(&out)
            .map_err(|e| AgentError::backend(format!("parsing vmadm lookup: {e}")))?;
        Ok(vms.into_iter().map(|vm| (vm.uuid.clone(), vm)).collect())
    }

    async fn get_agents(&self) -> AgentResult<Vec<AgentEntry>> {
        crate::read_agents_dir(&self.agents_root).await
    }

    async fn start_watchers(&self, dirty: DirtyFn) -> AgentResult<()> {
        // The zones index is rewritten on every machine create/destroy/state
        // change, which is exactly the set of events a sample cares about.
        let handle = tokio::spawn(async move {
            let mtime = |path: &str| {
                std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            };
            let mut last = mtime(ZONES_INDEX);
            let mut tick = tokio::time::interval(WATCH_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = mtime(ZONES_INDEX);
                if now > last {
                    last = now;
                    debug!("zones index changed");
                    dirty();
                }
            }
        });
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn stop_watchers(&self) {
        for handle in self.watchers.lock().await.drain(..) {
            handle.abort();
        }
    }

    async fn cleanup_stale_locks(&self) -> AgentResult<()> {
        // Machine tasks serialize on lock files under /var/run; a crashed
        // predecessor can leave them behind.
        let dir = std::path::Path::new("/var/run/node-agent");
        if !dir.is_dir() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lock") {
                debug!(path = %path.display(), "removing stale lock");
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
