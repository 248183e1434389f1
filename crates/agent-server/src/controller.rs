//! # Controller Link
//!
//! Every outbound request to the controller goes through one drain task,
//! so at most one HTTP call is in flight at any instant. Item kinds:
//!
//! - **heartbeat** — empty POST, rescheduled 5 s after the previous one
//!   completes; failures are logged and the cadence continues
//! - **status** — a coalesced slot: a newer sample replaces whatever is
//!   waiting, so bursts collapse into single posts of the latest value
//! - **sysinfo** — a coalesced slot with jittered exponential retry; a
//!   `404 ResourceNotFound` marks the feature unsupported and stops posts
//! - **agents** — the inventory registration, posted before heartbeating
//!   starts and re-drivable on demand

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agent_shared::backoff::Backoff;
use agent_shared::sample::{AgentEntry, SampleSnapshot};
use agent_shared::{AgentError, AgentResult};

/// Connect and request budget for every controller call
const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(5);
/// Gap between a completed heartbeat and the next one
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Thin typed client over the controller's server endpoints
#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    server_uuid: String,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, server_uuid: impl Into<String>) -> AgentResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONTROLLER_TIMEOUT)
            .timeout(CONTROLLER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            server_uuid: server_uuid.into(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/servers/{}{}", self.base_url, self.server_uuid, suffix)
    }

    async fn post(&self, url: &str, body: &Value) -> AgentResult<()> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(AgentError::controller(status.as_u16(), message))
    }

    pub async fn post_heartbeat(&self) -> AgentResult<()> {
        self.post(&self.url("/events/heartbeat"), &json!({})).await
    }

    pub async fn post_status(&self, snapshot: &SampleSnapshot) -> AgentResult<()> {
        self.post(&self.url("/events/status"), &serde_json::to_value(snapshot)?)
            .await
    }

    pub async fn post_sysinfo(&self, sysinfo: &Value) -> AgentResult<()> {
        self.post(&self.url("/sysinfo"), &json!({ "sysinfo": sysinfo }))
            .await
    }

    pub async fn post_agents(&self, agents: &[AgentEntry]) -> AgentResult<()> {
        self.post(&self.url(""), &json!({ "agents": agents })).await
    }
}

#[derive(Debug)]
enum Command {
    PostAgents(Vec<AgentEntry>),
    StartHeartbeats,
}

#[derive(Debug, Default)]
struct Slots {
    status: Option<SampleSnapshot>,
    sysinfo: Option<Value>,
}

/// Handle used by the rest of the agent to enqueue outbound updates
#[derive(Debug, Clone)]
pub struct ControllerLink {
    tx: mpsc::UnboundedSender<Command>,
    slots: Arc<Mutex<Slots>>,
    wake: Arc<Notify>,
}

impl ControllerLink {
    /// Spawn the drain task. The link serializes everything it sends.
    pub fn start(client: ControllerClient) -> (Self, JoinHandle<()>) {
        Self::start_with_heartbeat_interval(client, HEARTBEAT_INTERVAL)
    }

    /// Like [`ControllerLink::start`] with an explicit heartbeat gap; the
    /// test suite shortens it to observe the cadence quickly.
    pub fn start_with_heartbeat_interval(
        client: ControllerClient,
        heartbeat_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Mutex::new(Slots::default()));
        let wake = Arc::new(Notify::new());
        let link = Self {
            tx,
            slots: slots.clone(),
            wake: wake.clone(),
        };
        let task = tokio::spawn(drain_loop(client, rx, slots, wake, heartbeat_interval));
        (link, task)
    }

    /// Replace the pending status payload; bursts coalesce to the latest.
    pub async fn send_status(&self, snapshot: SampleSnapshot) {
        self.slots.lock().await.status = Some(snapshot);
        self.wake.notify_one();
    }

    /// Replace the pending sysinfo payload
    pub async fn send_sysinfo(&self, sysinfo: Value) {
        self.slots.lock().await.sysinfo = Some(sysinfo);
        self.wake.notify_one();
    }

    /// Register the agent inventory
    pub fn post_agents(&self, agents: Vec<AgentEntry>) {
        let _ = self.tx.send(Command::PostAgents(agents));
    }

    /// Begin the self-repeating heartbeat cadence
    pub fn start_heartbeats(&self) {
        let _ = self.tx.send(Command::StartHeartbeats);
    }
}

async fn drain_loop(
    client: ControllerClient,
    mut rx: mpsc::UnboundedReceiver<Command>,
    slots: Arc<Mutex<Slots>>,
    wake: Arc<Notify>,
    heartbeat_interval: Duration,
) {
    let mut next_heartbeat: Option<Instant> = None;
    let mut sysinfo_backoff = Backoff::controller_defaults();
    let mut sysinfo_not_before: Option<Instant> = None;
    let mut sysinfo_unsupported = false;

    loop {
        // Earliest timer we are waiting on, if any.
        let sysinfo_pending = {
            let slots = slots.lock().await;
            slots.sysinfo.is_some() && !sysinfo_unsupported
        };
        let sysinfo_due = if sysinfo_pending {
            Some(sysinfo_not_before.unwrap_or_else(Instant::now))
        } else {
            None
        };

        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => {
                    debug!("controller link closed");
                    return;
                }
                Some(Command::PostAgents(agents)) => {
                    match client.post_agents(&agents).await {
                        Ok(()) => info!(count = agents.len(), "posted agent inventory"),
                        Err(e) => warn!(error = %e, "failed to post agent inventory"),
                    }
                }
                Some(Command::StartHeartbeats) => {
                    next_heartbeat = Some(Instant::now());
                }
            },
            _ = wake.notified() => {
                // Slot state changed; fall through to the pumps below.
            }
            _ = sleep_until_opt(next_heartbeat) => {
                if let Err(e) = client.post_heartbeat().await {
                    warn!(error = %e, "heartbeat failed");
                }
                // Next beat runs a fixed gap after this one completed.
                next_heartbeat = Some(Instant::now() + heartbeat_interval);
            }
            _ = sleep_until_opt(sysinfo_due) => {
                // Timer handled by the sysinfo pump below.
            }
        }

        // Status pump: post the latest sample, if any.
        let status = slots.lock().await.status.take();
        if let Some(snapshot) = status {
            if let Err(e) = client.post_status(&snapshot).await {
                warn!(error = %e, "failed to post status");
            } else {
                debug!("posted status");
            }
        }

        // Sysinfo pump: retry with backoff until accepted or unsupported.
        let sysinfo_ready = sysinfo_not_before.map_or(true, |t| Instant::now() >= t);
        if !sysinfo_unsupported && sysinfo_ready {
            let sysinfo = slots.lock().await.sysinfo.take();
            if let Some(sysinfo) = sysinfo {
                match client.post_sysinfo(&sysinfo).await {
                    Ok(()) => {
                        info!("registered sysinfo");
                        sysinfo_backoff.reset();
                        sysinfo_not_before = None;
                    }
                    Err(e) if e.is_resource_not_found() => {
                        warn!("controller does not support sysinfo registration; skipping");
                        sysinfo_unsupported = true;
                    }
                    Err(e) => {
                        let delay = sysinfo_backoff.next_delay();
                        warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "sysinfo registration failed; will retry"
                        );
                        // Put the payload back unless a newer one arrived
                        // while we were posting.
                        let mut slots = slots.lock().await;
                        if slots.sysinfo.is_none() {
                            slots.sysinfo = Some(sysinfo);
                        }
                        sysinfo_not_before = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shapes() {
        let client =
            ControllerClient::new("http://cnapi.dc.example.com/", "abc-123").unwrap();
        assert_eq!(
            client.url("/events/heartbeat"),
            "http://cnapi.dc.example.com/servers/abc-123/events/heartbeat"
        );
        assert_eq!(
            client.url(""),
            "http://cnapi.dc.example.com/servers/abc-123"
        );
        assert_eq!(
            client.url("/sysinfo"),
            "http://cnapi.dc.example.com/servers/abc-123/sysinfo"
        );
    }
}
