//! # Disk-Usage Breakdown
//!
//! Classifies a host's dataset consumption into the counters reported by
//! status samples: hardware-virtualized machines (backing zvols plus their
//! dataset quotas), container zones, per-VM cores datasets, installed
//! images, and the unaccounted system remainder.
//!
//! The computation is a pure function over backend-supplied VM and dataset
//! listings so every backend shares one implementation.

use std::collections::{BTreeMap, HashSet};

use agent_shared::sample::{DiskUsage, VmSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One dataset row as reported by the platform (`zfs list -Hp` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub used: u64,
    #[serde(default)]
    pub available: u64,
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub volsize: Option<u64>,
    #[serde(default = "DatasetKind::filesystem")]
    pub kind: DatasetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Volume,
}

impl DatasetKind {
    fn filesystem() -> Self {
        DatasetKind::Filesystem
    }
}

/// Brands whose machines are full hardware VMs backed by zvols
fn is_hardware_virt(brand: &str) -> bool {
    matches!(brand, "kvm" | "bhyve")
}

/// Parse one line of `zfs list -Hpo name,used,avail,quota,volsize,type`
pub fn parse_zfs_list_line(line: &str) -> Option<Dataset> {
    let mut fields = line.split('\t');
    let name = fields.next()?.to_string();
    let used = fields.next()?.parse().ok()?;
    let available = fields.next()?.parse().ok()?;
    let quota = fields.next()?.parse().ok()?;
    let volsize = match fields.next()? {
        "-" => None,
        v => Some(v.parse().ok()?),
    };
    let kind = match fields.next()? {
        "volume" => DatasetKind::Volume,
        _ => DatasetKind::Filesystem,
    };
    Some(Dataset {
        name,
        used,
        available,
        quota,
        volsize,
        kind,
    })
}

/// Compute the twelve-counter breakdown.
///
/// `installed_images` is the set of image UUIDs the backend confirmed to be
/// installed with a non-trivial manifest; datasets named `<pool>/<uuid>`
/// are charged to images only when their UUID is in that set.
pub fn compute_disk_usage(
    vms: &BTreeMap<String, VmSummary>,
    datasets: &[Dataset],
    installed_images: &HashSet<String>,
) -> DiskUsage {
    let mut usage = DiskUsage::default();

    let by_name: BTreeMap<&str, &Dataset> =
        datasets.iter().map(|d| (d.name.as_str(), d)).collect();

    // Pool totals come from the root datasets.
    for ds in datasets {
        if !ds.name.contains('/') {
            usage.pool_size_bytes += ds.used + ds.available;
            usage.pool_alloc_bytes += ds.used;
        }
    }

    for vm in vms.values() {
        let vm_ds = datasets
            .iter()
            .find(|d| second_component(&d.name) == Some(vm.uuid.as_str()));

        if is_hardware_virt(&vm.brand) {
            // Backing volumes are siblings named `<pool>/<uuid>-disk<n>`.
            let disk_prefix = format!("{}-disk", vm.uuid);
            for ds in datasets {
                if ds.kind == DatasetKind::Volume
                    && second_component(&ds.name)
                        .is_some_and(|c| c.starts_with(&disk_prefix))
                {
                    usage.kvm_zvol_used_bytes += ds.used;
                    usage.kvm_zvol_volsize_bytes += ds.volsize.unwrap_or(0);
                }
            }
            if let Some(ds) = vm_ds {
                usage.kvm_quota_bytes += ds.quota;
                usage.kvm_quota_used_bytes += ds.used;
            }
        } else if let Some(ds) = vm_ds {
            usage.zone_quota_bytes += ds.quota;
            usage.zone_quota_used_bytes += ds.used;
        }

        if let Some(pool) = vm_ds.and_then(|d| d.name.split('/').next()) {
            if let Some(cores) = by_name.get(format!("{pool}/cores/{}", vm.uuid).as_str()) {
                usage.cores_quota_bytes += cores.quota;
                usage.cores_quota_used_bytes += cores.used;
            }
        }
    }

    // Installed images sit at `<pool>/<uuid>`; only count UUIDs the backend
    // vouches for, and never ones that are machines.
    for ds in datasets {
        if let Some(second) = second_component(&ds.name) {
            if Uuid::parse_str(second).is_ok()
                && installed_images.contains(second)
                && !vms.contains_key(second)
            {
                usage.installed_images_used_bytes += ds.used;
            }
        }
    }

    usage.system_used_bytes = usage.pool_alloc_bytes as i64
        - (usage.kvm_zvol_used_bytes
            + usage.kvm_quota_used_bytes
            + usage.zone_quota_used_bytes
            + usage.cores_quota_used_bytes
            + usage.installed_images_used_bytes) as i64;

    usage
}

/// Second path component of a dataset name, when the name has exactly two
fn second_component(name: &str) -> Option<&str> {
    let mut parts = name.split('/');
    let _pool = parts.next()?;
    let second = parts.next()?;
    if parts.next().is_some() {
        None
    } else {
        Some(second)
    }
}
