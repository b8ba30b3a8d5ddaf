use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::info;

use crate::agents::{PhaseAgents, TargetEndpoint};
use crate::errors::OrchestratorError;
use crate::runtime::Runtime;
use crate::ws;

const DEFAULT_LOG_LIMIT: i64 = 200;
const MAX_LOG_LIMIT: i64 = 1000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runtime: Runtime,
    pub agents: PhaseAgents,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTargetRequest {
    pub target_url: String,
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::AlreadyRunning { .. } => ApiError::Conflict(err.to_string()),
            OrchestratorError::TargetNotFound { .. } => ApiError::NotFound(err.to_string()),
            OrchestratorError::Phase { .. } | OrchestratorError::Store(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

fn no_active_run(target_id: i64) -> ApiError {
    ApiError::NotFound(format!("No active pentest for target {}", target_id))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/targets", get(list_targets).post(create_target))
        .route("/api/targets/{id}", get(get_target))
        .route("/api/targets/{id}/scan", post(start_scan))
        .route("/api/targets/{id}/approve", post(approve_exploit))
        .route("/api/targets/{id}/cancel", post(cancel_scan))
        .route("/api/targets/{id}/status", get(scan_status))
        .route("/api/targets/{id}/jobs", get(list_jobs))
        .route("/api/targets/{id}/logs", get(list_logs))
        .route("/api/targets/{id}/findings", get(list_findings))
        .route("/ws/{target_id}", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_targets(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let targets = state
        .runtime
        .db
        .call(|db| db.list_targets())
        .await
        .map_err(internal)?;
    Ok(Json(targets))
}

async fn create_target(
    State(state): State<SharedState>,
    Json(req): Json<CreateTargetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = TargetEndpoint::parse(&req.target_url)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    let name = match req.name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => endpoint.host.clone(),
    };
    let target_url = endpoint.target_url;
    let target = state
        .runtime
        .db
        .call(move |db| db.create_target(&name, &target_url))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(target)))
}

async fn get_target(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .runtime
        .db
        .call(move |db| db.get_target(id))
        .await
        .map_err(internal)?;
    match target {
        Some(target) => Ok(Json(target)),
        None => Err(ApiError::NotFound(format!("Target {} not found", id))),
    }
}

async fn start_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (control, _handle) = state
        .runtime
        .start_pentest(state.agents.clone(), id)
        .await?;
    info!(target_id = id, run_id = %control.run_id(), "scan requested over HTTP");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "run_id": control.run_id(),
            "target_id": id,
        })),
    ))
}

async fn approve_exploit(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.runtime.registry.approve(id) {
        Some(approved) => Ok(Json(serde_json::json!({ "approved": approved }))),
        None => Err(no_active_run(id)),
    }
}

async fn cancel_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.runtime.registry.cancel(id) {
        info!(target_id = id, "cancel requested over HTTP");
        Ok(Json(serde_json::json!({ "cancelled": true })))
    } else {
        Err(no_active_run(id))
    }
}

async fn scan_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .runtime
        .db
        .call(move |db| db.get_target(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Target {} not found", id)))?;
    Ok(Json(serde_json::json!({
        "target_id": id,
        "status": target.status,
        "active_run": state.runtime.registry.status(id),
    })))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .runtime
        .db
        .call(move |db| db.list_tool_jobs(id))
        .await
        .map_err(internal)?;
    Ok(Json(jobs))
}

async fn list_logs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let events = state
        .runtime
        .db
        .call(move |db| db.list_events(id, limit))
        .await
        .map_err(internal)?;
    Ok(Json(events))
}

async fn list_findings(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let findings = state
        .runtime
        .db
        .call(move |db| db.list_findings(id))
        .await
        .map_err(internal)?;
    Ok(Json(findings))
}
