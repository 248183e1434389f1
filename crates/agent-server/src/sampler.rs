//! # Status Sampler
//!
//! Watches the system and publishes [`SampleSnapshot`]s. Three inputs mark
//! the sample dirty: backend watchers (machine churn), a sysinfo change,
//! and an unconditional maximum interval. A 500 ms scheduler tick starts a
//! refresh when dirty and outside the throttle window; only one refresh
//! runs at a time and skipped requests are counted.
//!
//! A refresh gathers, in order: the VM projection, pool stats, memory,
//! the disk-usage breakdown, and boot time. Any stage error discards the
//! sample and re-arms the dirty bit; a success publishes atomically and
//! hands the snapshot to the publish hook (the controller link).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use agent_backend::NodeBackend;
use agent_shared::sample::SampleSnapshot;
use agent_shared::AgentResult;

/// Consecutive refresh skips tolerated before escalating to an error log
const SKIP_ESCALATION: u32 = 10;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// The sample goes dirty unconditionally this often
    pub max_interval: Duration,
    /// Scheduler tick: dirty checks happen at this cadence
    pub status_interval: Duration,
    /// Minimum gap between refresh starts
    pub throttle: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(60),
            status_interval: Duration::from_millis(500),
            throttle: Duration::from_secs(5),
        }
    }
}

/// Callback invoked with each published snapshot
pub type PublishFn = Arc<dyn Fn(SampleSnapshot) + Send + Sync>;

/// Running sampler: the published snapshot stream plus the dirty trigger
pub struct SamplerHandle {
    snapshot_rx: watch::Receiver<Option<Arc<SampleSnapshot>>>,
    dirty: Arc<AtomicBool>,
    backend: Arc<dyn NodeBackend>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Most recent published snapshot, if any refresh has completed
    pub fn current(&self) -> Option<Arc<SampleSnapshot>> {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver for observers that want change notifications
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SampleSnapshot>>> {
        self.snapshot_rx.clone()
    }

    /// Request a refresh at the next scheduler tick
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub async fn stop(self) {
        self.task.abort();
        self.backend.stop_watchers().await;
    }
}

/// Install watchers and start the scheduler loop.
pub async fn start(
    backend: Arc<dyn NodeBackend>,
    config: SamplerConfig,
    on_publish: PublishFn,
) -> AgentResult<SamplerHandle> {
    let dirty = Arc::new(AtomicBool::new(true));
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    let watcher_dirty = dirty.clone();
    backend
        .start_watchers(Arc::new(move || {
            watcher_dirty.store(true, Ordering::SeqCst);
        }))
        .await?;

    let task = tokio::spawn(scheduler_loop(
        backend.clone(),
        config,
        dirty.clone(),
        snapshot_tx,
        on_publish,
    ));

    Ok(SamplerHandle {
        snapshot_rx,
        dirty,
        backend,
        task,
    })
}

async fn scheduler_loop(
    backend: Arc<dyn NodeBackend>,
    config: SamplerConfig,
    dirty: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<Option<Arc<SampleSnapshot>>>,
    on_publish: PublishFn,
) {
    let refreshing = Arc::new(AtomicBool::new(false));
    let skips = Arc::new(AtomicU32::new(0));
    let mut last_unconditional = Instant::now();
    let mut throttle_until = Instant::now();

    let mut tick = tokio::time::interval(config.status_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        if last_unconditional.elapsed() >= config.max_interval {
            last_unconditional = Instant::now();
            dirty.store(true, Ordering::SeqCst);
        }

        if !dirty.load(Ordering::SeqCst) || Instant::now() < throttle_until {
            continue;
        }

        if refreshing.swap(true, Ordering::SeqCst) {
            // A refresh is still running; count the skip and keep trying.
            let skipped = skips.fetch_add(1, Ordering::SeqCst) + 1;
            if skipped == SKIP_ESCALATION {
                error!(
                    skipped = skipped,
                    "sample refreshes skipped repeatedly; previous refresh still running"
                );
            } else {
                debug!(skipped = skipped, "sample refresh skipped; lock held");
            }
            continue;
        }
        skips.store(0, Ordering::SeqCst);
        dirty.store(false, Ordering::SeqCst);
        throttle_until = Instant::now() + config.throttle;

        let backend = backend.clone();
        let dirty = dirty.clone();
        let refreshing = refreshing.clone();
        let snapshot_tx = snapshot_tx.clone();
        let on_publish = on_publish.clone();
        tokio::spawn(async move {
            match refresh(backend.as_ref()).await {
                Ok(snapshot) => {
                    debug!(
                        vms = snapshot.vms.len(),
                        "publishing status sample"
                    );
                    let shared = Arc::new(snapshot.clone());
                    let _ = snapshot_tx.send(Some(shared));
                    on_publish(snapshot);
                }
                Err(e) => {
                    warn!(error = %e, "sample refresh failed; will retry");
                    dirty.store(true, Ordering::SeqCst);
                }
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }
}

/// One full gather pass over the backend
pub async fn refresh(backend: &dyn NodeBackend) -> AgentResult<SampleSnapshot> {
    let vms = backend.load_vms().await?;
    let zpool_status = backend.get_zpool_info().await?;
    let meminfo = backend.get_memory_info().await?;
    let diskinfo = backend.get_disk_usage(&vms).await?;
    let boot_time = backend.get_boot_time().await?;

    Ok(SampleSnapshot {
        vms,
        zpool_status,
        meminfo,
        diskinfo,
        boot_time,
        timestamp: Utc::now(),
    })
}

/// Log a one-line summary of a published sample
pub fn log_sample(snapshot: &SampleSnapshot) {
    info!(
        vms = snapshot.vms.len(),
        pools = snapshot.zpool_status.len(),
        mem_total = snapshot.meminfo.total_bytes,
        "status sample published"
    );
}
