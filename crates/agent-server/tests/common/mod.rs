//! Shared helpers for the agent integration suite: a recording mock
//! controller and a full agent started against a simulated server tree.

// Each test binary uses its own slice of these helpers.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use agent_server::bootstrap::{bootstrap, AgentHandle, BootstrapOptions};
use agent_server::sampler::SamplerConfig;
use agent_shared::config::{AgentConfig, BackendKind};

pub const TEST_SERVER_UUID: &str = "564d5535-aaaa-bbbb-cccc-000000000001";

// ---------------------------------------------------------------------------
// Mock controller
// ---------------------------------------------------------------------------

/// One request the mock controller saw
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub body: Value,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SysinfoMode {
    #[default]
    Accept,
    Fail,
    NotFound,
}

#[derive(Clone, Default)]
pub struct ControllerState {
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    pub sysinfo_mode: Arc<Mutex<SysinfoMode>>,
    /// Applied to the next status post only, then cleared
    pub status_delay_once: Arc<Mutex<Option<Duration>>>,
}

impl ControllerState {
    fn record(&self, path: String, body: Value) {
        self.requests.lock().unwrap().push(Recorded {
            path,
            body,
            at: Instant::now(),
        });
    }

    pub fn matching(&self, suffix: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn count(&self, suffix: &str) -> usize {
        self.matching(suffix).len()
    }

    pub fn set_sysinfo_mode(&self, mode: SysinfoMode) {
        *self.sysinfo_mode.lock().unwrap() = mode;
    }

    pub fn delay_next_status(&self, delay: Duration) {
        *self.status_delay_once.lock().unwrap() = Some(delay);
    }
}

pub struct MockController {
    pub url: String,
    pub state: ControllerState,
    _task: JoinHandle<()>,
}

pub async fn start_mock_controller() -> MockController {
    let state = ControllerState::default();

    async fn agents(
        State(state): State<ControllerState>,
        axum::extract::Path(uuid): axum::extract::Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(format!("/servers/{uuid}"), body);
        (StatusCode::OK, Json(json!({})))
    }

    async fn sysinfo(
        State(state): State<ControllerState>,
        axum::extract::Path(uuid): axum::extract::Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(format!("/servers/{uuid}/sysinfo"), body);
        match *state.sysinfo_mode.lock().unwrap() {
            SysinfoMode::Accept => (StatusCode::OK, Json(json!({}))),
            SysinfoMode::Fail => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "boom"})),
            ),
            SysinfoMode::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"code": "ResourceNotFound"})),
            ),
        }
    }

    async fn heartbeat(
        State(state): State<ControllerState>,
        axum::extract::Path(uuid): axum::extract::Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(format!("/servers/{uuid}/events/heartbeat"), body);
        (StatusCode::OK, Json(json!({})))
    }

    async fn status(
        State(state): State<ControllerState>,
        axum::extract::Path(uuid): axum::extract::Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(format!("/servers/{uuid}/events/status"), body);
        let delay = state.status_delay_once.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (StatusCode::OK, Json(json!({})))
    }

    let app = Router::new()
        .route("/servers/{uuid}", post(agents))
        .route("/servers/{uuid}/sysinfo", post(sysinfo))
        .route("/servers/{uuid}/events/heartbeat", post(heartbeat))
        .route("/servers/{uuid}/events/status", post(status))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockController {
        url,
        state,
        _task: task,
    }
}

// ---------------------------------------------------------------------------
// Agent harness
// ---------------------------------------------------------------------------

/// Seed one simulated server directory
pub fn seed_server_dir(dir: &Path, uuid: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("sysinfo.json"),
        json!({
            "UUID": uuid,
            "Boot Time": 1_700_000_000,
            "Network Interfaces": {
                "net0": {"ip4addr": "127.0.0.1", "NIC Names": ["admin"]},
            },
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("memory.json"),
        json!({"availrmem_bytes": 1024, "arcsize_bytes": 0, "total_bytes": 8192}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("zpools.json"),
        json!({"zones": {"bytes_available": 900, "bytes_used": 100}}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("agents.json"),
        json!([
            {
                "name": "vm-agent",
                "uuid": "7b8ba9fa-0000-4000-8000-000000000001",
                "image_uuid": "7b8ba9fa-0000-4000-8000-000000000002",
                "version": "2.1.0",
            }
        ])
        .to_string(),
    )
    .unwrap();
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub timeout_seconds: u64,
    pub cnapi_url: Option<String>,
    pub update_helper: bool,
    pub sampler: Option<SamplerConfig>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            // Nothing routable; outbound posts fail fast and stay local.
            cnapi_url: Some("http://127.0.0.1:1".to_string()),
            update_helper: false,
            sampler: None,
        }
    }
}

pub struct TestAgent {
    pub handle: AgentHandle,
    pub url: String,
    pub http: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestAgent {
    pub async fn post_task(&self, task: &str, params: Value) -> reqwest::Response {
        self.http
            .post(format!("{}/tasks", self.url))
            .json(&json!({ "task": task, "params": params }))
            .send()
            .await
            .unwrap()
    }

    pub async fn history(&self) -> Vec<Value> {
        self.http
            .get(format!("{}/history", self.url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

/// Start a full agent over a freshly seeded single-server simulation tree.
pub async fn start_agent(options: AgentOptions) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    seed_server_dir(dir.path(), TEST_SERVER_UUID);
    start_agent_in(dir, options).await
}

/// Start a full agent over an existing simulation tree.
pub async fn start_agent_in(dir: tempfile::TempDir, options: AgentOptions) -> TestAgent {
    let mut config = AgentConfig::default();
    config.backend = BackendKind::Mock;
    config.simulation_root = Some(dir.path().to_path_buf());
    config.tasklogdir = dir.path().join("logs");
    config.listen_ip = "127.0.0.1".to_string();
    config.listen_port = 0;
    config.timeout_seconds = options.timeout_seconds;
    config.cnapi.url = options.cnapi_url.clone();
    config.update_helper = options.update_helper;

    let handle = bootstrap(BootstrapOptions {
        config,
        config_path: None,
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_node-agent"))),
        sampler: options.sampler.clone(),
    })
    .await
    .unwrap();

    let url = format!("http://{}", handle.local_addr);
    TestAgent {
        handle,
        url,
        http: reqwest::Client::new(),
        _dir: dir,
    }
}

/// Poll until `predicate` holds or the deadline passes
pub async fn wait_for<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
