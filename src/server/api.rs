use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::rate_limit::RateLimiter;
use crate::config::Settings;
use crate::errors::{ExecutionError, PublishError};
use crate::execution::{ExecutionId, ExecutionRequest};
use crate::orchestrator::{ExecutionConfig, Orchestrator};
use crate::publish::Publisher;

/// Bead id recorded on review executions, which are not tied to a bead.
pub const REVIEW_BEAD_ID: &str = "review";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub publisher: Publisher,
    pub settings: Arc<Settings>,
    /// Shared by the work and review endpoints.
    pub work_limiter: RateLimiter,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct OffsetQuery {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Deserialize)]
pub struct PushQuery {
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct OutputPage {
    pub chunks: Vec<String>,
    pub next_offset: usize,
    pub finished: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::NotFound { .. } | ExecutionError::NotAttachable { .. } => {
                ApiError::NotFound(err.to_string())
            }
            ExecutionError::AlreadyRunning { .. } | ExecutionError::NotCancellable { .. } => {
                ApiError::Conflict(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Locked(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/projects/{project_id}/work/{bead_id}", post(start_work))
        .route("/api/projects/{project_id}/review", post(start_review))
        .route("/api/projects/{project_id}/attach", get(attach_info))
        .route("/api/projects/{project_id}/progress", get(project_progress))
        .route("/api/projects/{project_id}/push-pr", post(push_pr))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/output", get(execution_output))
        .route("/api/executions/{id}/stream", get(stream_execution))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_execution_id(id: &str) -> Result<ExecutionId, ApiError> {
    id.parse().map_err(ApiError::BadRequest)
}

/// Resolve a project id to an existing directory in the workspace.
fn resolve_project(state: &SharedState, project_id: &str) -> Result<std::path::PathBuf, ApiError> {
    let path = state
        .settings
        .project_path(project_id)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid project id: {}", project_id)))?;
    if !path.is_dir() {
        return Err(ApiError::NotFound(format!("Project {} not found", project_id)));
    }
    Ok(path)
}

fn check_rate_limit(state: &SharedState) -> Result<(), ApiError> {
    state.work_limiter.check().map_err(|retry| {
        ApiError::TooManyRequests(format!(
            "Rate limit exceeded, retry in {}s",
            retry.as_secs().max(1)
        ))
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_work(
    State(state): State<SharedState>,
    Path((project_id, bead_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate_limit(&state)?;
    let project_path = resolve_project(&state, &project_id)?;
    let gates = state
        .settings
        .gates_for_project(&project_path)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    let config = ExecutionConfig::from_settings(&state.settings, gates);

    let request = ExecutionRequest {
        project_id,
        bead_id,
        project_path,
    };
    let id = state.orchestrator.start(request, config).await?;
    let execution = state.orchestrator.get_status(id)?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn start_review(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate_limit(&state)?;
    let project_path = resolve_project(&state, &project_id)?;
    let request = ExecutionRequest {
        project_id,
        bead_id: REVIEW_BEAD_ID.to_string(),
        project_path,
    };
    let config = ExecutionConfig::for_review(&state.settings);
    let id = state.orchestrator.start(request, config).await?;
    let execution = state.orchestrator.get_status(id)?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn attach_info(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    resolve_project(&state, &project_id)?;
    Ok(Json(state.orchestrator.attach(&project_id)?))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.orchestrator.get_status(id)?))
}

async fn cancel_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.orchestrator.cancel(id).await?))
}

async fn execution_output(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<OffsetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_execution_id(&id)?;
    let (chunks, finished) = state.orchestrator.output_since(id, query.offset)?;
    let next_offset = query.offset + chunks.len();
    Ok(Json(OutputPage {
        chunks,
        next_offset,
        finished,
    }))
}

async fn stream_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<OffsetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_execution_id(&id)?;
    let chunks = state.orchestrator.stream_output(id, query.offset)?;
    let events = chunks.map(|chunk| Ok::<_, Infallible>(Event::default().data(chunk)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn project_progress(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.settings.project_path(&project_id).is_none() {
        return Err(ApiError::BadRequest(format!("Invalid project id: {}", project_id)));
    }
    Ok(Json(state.orchestrator.progress(&project_id)))
}

async fn push_pr(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<PushQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project_path = resolve_project(&state, &project_id)?;
    let result = state
        .publisher
        .push_and_open_pr(&project_path, query.title.as_deref())
        .await?;
    Ok(Json(result))
}
