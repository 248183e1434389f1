//! # HTTP Surface
//!
//! The inbound RPC surface the controller talks to:
//!
//! - `POST /tasks` — submit a task; `x-server-uuid` selects the target
//!   server when this agent fronts several (simulator)
//! - `GET /history` — the bounded recent-task ring
//! - `POST /pause` / `POST /resume` — drain control used during self-update
//!
//! Requests ride under a one-hour timeout; non-2xx responses and all
//! non-GET requests are audit-logged; handler panics come back as
//! structured 500 bodies instead of dropped connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agent_shared::protocol::TaskRequest;
use agent_shared::AgentResult;

use crate::dispatch::{DispatchResult, Dispatcher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

/// Shared state behind the router: the server-uuid → dispatcher table
/// (written once at startup) and the draining flag.
#[derive(Clone)]
pub struct AppState {
    handlers: Arc<DashMap<String, Dispatcher>>,
    primary_uuid: String,
    draining: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(primary: Dispatcher) -> Self {
        let primary_uuid = primary.server_uuid().to_string();
        let handlers = Arc::new(DashMap::new());
        handlers.insert(primary_uuid.clone(), primary);
        Self {
            handlers,
            primary_uuid,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register an additional simulated server
    pub fn add_server(&self, dispatcher: Dispatcher) {
        self.handlers
            .insert(dispatcher.server_uuid().to_string(), dispatcher);
    }

    pub fn primary_uuid(&self) -> &str {
        &self.primary_uuid
    }

    fn select(&self, server_uuid: Option<&str>) -> Option<Dispatcher> {
        let uuid = server_uuid.unwrap_or(&self.primary_uuid);
        self.handlers.get(uuid).map(|entry| entry.value().clone())
    }

    pub fn pause(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Build the agent's router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(post_task))
        .route("/history", get(get_history))
        .route("/pause", post(post_pause))
        .route("/resume", post(post_resume))
        .layer(middleware::from_fn(audit))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener is closed
pub async fn serve(state: AppState, listener: tokio::net::TcpListener) -> AgentResult<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TaskSubmission {
    task: Option<String>,
    params: Option<Value>,
    req_id: Option<String>,
}

async fn post_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TaskSubmission>,
) -> Response {
    if state.is_draining() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "agent is draining; not accepting new tasks",
        );
    }

    let server_uuid = headers
        .get("x-server-uuid")
        .and_then(|v| v.to_str().ok());
    let Some(dispatcher) = state.select(server_uuid) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no such server: {}", server_uuid.unwrap_or("<default>")),
        );
    };

    let task = match body.task {
        Some(task) if !task.is_empty() => task,
        _ => return error_response(StatusCode::BAD_REQUEST, "missing task"),
    };
    let Some(params) = body.params else {
        return error_response(StatusCode::BAD_REQUEST, "missing params");
    };

    let mut req = TaskRequest::new(task, params, body.req_id);
    req.req_host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match dispatcher.dispatch(req).await {
        DispatchResult::Finished(value) => (StatusCode::OK, Json(value)).into_response(),
        DispatchResult::Failed(error) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
        DispatchResult::UnknownTask(task) => {
            error_response(StatusCode::NOT_FOUND, format!("no such task: {task}"))
        }
        DispatchResult::Expired(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Task expired")
        }
    }
}

async fn get_history(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let server_uuid = headers
        .get("x-server-uuid")
        .and_then(|v| v.to_str().ok());
    let Some(dispatcher) = state.select(server_uuid) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no such server: {}", server_uuid.unwrap_or("<default>")),
        );
    };
    (StatusCode::OK, Json(dispatcher.history().snapshot())).into_response()
}

async fn post_pause(State(state): State<AppState>) -> Response {
    info!("pausing task dispatch");
    state.pause();
    (StatusCode::OK, Json(json!({ "draining": true }))).into_response()
}

async fn post_resume(State(state): State<AppState>) -> Response {
    info!("resuming task dispatch");
    state.resume();
    (StatusCode::OK, Json(json!({ "draining": false }))).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    warn!(error = %detail, "request handler panicked");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, detail)
}

/// Log every non-GET request and every response outside 2xx
async fn audit(req: Request, next: Next) -> Response {
    let method: Method = req.method().clone();
    let uri: Uri = req.uri().clone();
    let response = next.run(req).await;
    let status = response.status();
    if !status.is_success() {
        warn!(method = %method, uri = %uri, status = %status.as_u16(), "request failed");
    } else if method != Method::GET {
        info!(method = %method, uri = %uri, status = %status.as_u16(), "request");
    }
    response
}
