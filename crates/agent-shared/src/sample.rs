//! # Status Sample Types
//!
//! The snapshot the sampler publishes and the controller link posts to
//! `/servers/<uuid>/events/status`, plus the agent inventory shape posted
//! at registration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Projection of a virtual machine used by status samples. The sampler
/// always loads this fixed field set, never full machine records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub uuid: String,
    #[serde(default)]
    pub owner_uuid: Option<String>,
    /// Dataset quota in gibibytes, as reported by the platform
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub max_physical_memory: u64,
    #[serde(default)]
    pub zone_state: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    pub brand: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Free/used bytes for one storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub bytes_available: u64,
    pub bytes_used: u64,
}

/// Host memory counters, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub availrmem_bytes: u64,
    pub arcsize_bytes: u64,
    pub total_bytes: u64,
}

/// Disk-usage breakdown: where the pool's allocated bytes went.
///
/// `system_used_bytes` is the remainder after subtracting every classified
/// consumer from the pool allocation, and may be negative when quotas
/// overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub kvm_zvol_used_bytes: u64,
    pub kvm_zvol_volsize_bytes: u64,
    pub kvm_quota_bytes: u64,
    pub kvm_quota_used_bytes: u64,
    pub zone_quota_bytes: u64,
    pub zone_quota_used_bytes: u64,
    pub cores_quota_bytes: u64,
    pub cores_quota_used_bytes: u64,
    pub installed_images_used_bytes: u64,
    pub pool_size_bytes: u64,
    pub pool_alloc_bytes: u64,
    pub system_used_bytes: i64,
}

/// One status sample. Immutable once published; observers hold a reference
/// to the current value and the sampler replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSnapshot {
    pub vms: BTreeMap<String, VmSummary>,
    #[serde(rename = "zpoolStatus")]
    pub zpool_status: BTreeMap<String, PoolStatus>,
    pub meminfo: MemoryInfo,
    pub diskinfo: DiskUsage,
    pub boot_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// One installed agent, as reported to the controller at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub uuid: Uuid,
    pub image_uuid: Uuid,
    pub version: String,
}

/// Opaque sysinfo blob as produced by the platform
pub type Sysinfo = Value;
