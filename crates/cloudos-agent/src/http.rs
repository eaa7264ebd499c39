use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cloudos_action::{ExecutionResult, StatusSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::error_payload::ApiError;
use crate::executor::ActionExecutor;
use crate::proxy::{self, ProxyTarget};
use crate::security;
use crate::status::StatusReporter;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone)]
pub struct AppState {
    pub executor: ActionExecutor,
    pub status: StatusReporter,
    pub vnc: ProxyTarget,
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct AddCommandRequest {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Serialize)]
struct AddCommandResponse {
    ok: bool,
    name: String,
    argv: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    os: String,
    cpu_usage: String,
    ram_usage: String,
    disk_usage: String,
    // Not sampled.
    uptime: &'static str,
    metrics: StatusSnapshot,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            status: "online",
            os: s.os.clone(),
            cpu_usage: format!("{:.1}%", s.cpu_percent),
            ram_usage: format!(
                "{:.2}GB / {:.2}GB",
                s.memory_used_bytes as f64 / GIB,
                s.memory_total_bytes as f64 / GIB
            ),
            disk_usage: format!("{:.1}%", s.disk_percent),
            uptime: "N/A",
            metrics: s,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let os = Router::new()
        .route("/status", get(get_status))
        .route("/action", post(execute_action))
        .route("/commands", get(list_commands).post(add_command))
        .route("/vnc", get(vnc_ws))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::require_token,
        ));

    Router::new()
        .route("/", get(root))
        .nest("/os", os)
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "CloudOS Controller Online" }))
}

async fn get_status(State(state): State<AppState>) -> Response {
    match state.status.get_status().await {
        Ok(snapshot) => Json(StatusResponse::from(snapshot)).into_response(),
        // Same message as a 200 `{"error": ...}` body would carry, but as a real 500.
        Err(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "status_unavailable", e.to_string())
            .into_response(),
    }
}

async fn execute_action(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let result = state.executor.execute(req.command.trim()).await;
    if let ExecutionResult::Failed { kind, error } = &result {
        return Err(ApiError::bad_request(kind.as_str(), error.clone()));
    }
    Ok(Json(result))
}

async fn list_commands(State(state): State<AppState>) -> Json<cloudos_action::ActionMap> {
    Json((*state.executor.list_actions()).clone())
}

async fn add_command(
    State(state): State<AppState>,
    Json(req): Json<AddCommandRequest>,
) -> Result<Json<AddCommandResponse>, ApiError> {
    match state.executor.add_action(&req.name, &req.command).await {
        Ok(argv) => Ok(Json(AddCommandResponse {
            ok: true,
            name: req.name.trim().to_string(),
            argv,
        })),
        Err(e) => {
            tracing::warn!(action = %req.name, error = %e, "add action rejected");
            let err = match &e {
                RegistryError::Persist { .. } | RegistryError::Serialize(_) => {
                    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string())
                }
                RegistryError::Parse(_) => ApiError::bad_request(e.code(), e.to_string())
                    .with_hint("Check that every quote is closed."),
                RegistryError::ProgramNotFound(_) => ApiError::bad_request(e.code(), e.to_string())
                    .with_hint("Use an absolute path or a program on the agent's PATH."),
                RegistryError::EmptyName | RegistryError::EmptyCommand => {
                    ApiError::bad_request(e.code(), e.to_string())
                }
            };
            Err(err)
        }
    }
}

async fn vnc_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        proxy::run_websocket_session(socket, &state.vnc).await;
    })
}
