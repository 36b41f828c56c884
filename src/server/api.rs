use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::phase::PhaseDefinition;
use crate::pipeline::models::{
    Command, PipelineConfig, PipelineId, PipelineInstance, PipelineStatus,
};
use crate::pipeline::orchestrator::Orchestrator;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreatePipelineRequest {
    pub niche: String,
    pub topic: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub approval_overrides: BTreeMap<usize, bool>,
}

#[derive(Deserialize, Default)]
pub struct ReviewRequest {
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct EditOutputRequest {
    pub output: serde_json::Value,
}

#[derive(Deserialize)]
pub struct TogglePhaseRequest {
    pub requires_approval: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Serialize)]
pub struct PipelinePage {
    pub pipelines: Vec<PipelineInstance>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::Validation(_)
            | PipelineError::PhaseOutOfRange { .. }
            | PipelineError::Catalog(_) => ApiError::BadRequest(message),
            PipelineError::NotFound { .. } => ApiError::NotFound(message),
            PipelineError::InvalidState { .. } => ApiError::Conflict(message),
            PipelineError::Invariant { .. } | PipelineError::Store(_) => {
                tracing::error!(error = %message, "command.internal_error");
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/pipelines", get(list_pipelines).post(create_pipeline))
        .route("/api/pipelines/stats", get(pipeline_stats))
        .route("/api/pipelines/{id}", get(get_pipeline))
        .route("/api/pipelines/{id}/start", post(start_pipeline))
        .route("/api/pipelines/{id}/stop", post(stop_pipeline))
        .route("/api/pipelines/{id}/approve", post(approve_phase))
        .route("/api/pipelines/{id}/reject", post(reject_phase))
        .route(
            "/api/pipelines/{id}/phases/{index}/output",
            put(edit_phase_output),
        )
        .route("/api/approvals/pending", get(pending_approvals))
        .route("/api/phases", get(list_phases))
        .route("/api/phases/{index}", patch(toggle_phase))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> Result<PipelineId, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

fn parse_status(raw: Option<&str>) -> Result<Option<PipelineStatus>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map(Some).map_err(ApiError::BadRequest),
        None => Ok(None),
    }
}

fn paginate(all: Vec<PipelineInstance>, page: Option<usize>, per_page: Option<usize>) -> PipelinePage {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = all.len();
    let pipelines = all
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .collect();
    PipelinePage {
        pipelines,
        total,
        page,
        per_page,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_pipelines(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let all = state.orchestrator.list(status).await?;
    Ok(Json(paginate(all, query.page, query.per_page)))
}

async fn create_pipeline(
    State(state): State<SharedState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = state
        .orchestrator
        .apply(Command::Create {
            niche: req.niche,
            topic: req.topic,
            auto_start: req.auto_start,
            config: PipelineConfig {
                approval_overrides: req.approval_overrides,
            },
        })
        .await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn pipeline_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.stats().await?))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get(id).await?))
}

async fn start_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.apply(Command::Start { id }).await?))
}

async fn stop_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.apply(Command::Stop { id }).await?))
}

async fn approve_phase(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let notes = body.and_then(|Json(r)| r.notes);
    Ok(Json(
        state.orchestrator.apply(Command::Approve { id, notes }).await?,
    ))
}

async fn reject_phase(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let notes = body.and_then(|Json(r)| r.notes);
    Ok(Json(
        state.orchestrator.apply(Command::Reject { id, notes }).await?,
    ))
}

async fn edit_phase_output(
    State(state): State<SharedState>,
    Path((id, phase_index)): Path<(String, usize)>,
    Json(req): Json<EditOutputRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let pipeline = state
        .orchestrator
        .apply(Command::EditOutput {
            id,
            phase_index,
            output: req.output,
        })
        .await?;
    Ok(Json(pipeline))
}

async fn pending_approvals(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.pending_approvals().await?))
}

async fn list_phases(State(state): State<SharedState>) -> Json<Vec<PhaseDefinition>> {
    Json(state.orchestrator.catalog().phases().to_vec())
}

async fn toggle_phase(
    State(state): State<SharedState>,
    Path(index): Path<usize>,
    Json(req): Json<TogglePhaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.requires_approval.is_none() && req.enabled.is_none() {
        return Err(ApiError::BadRequest(
            "nothing to change: provide requires_approval and/or enabled".into(),
        ));
    }
    let catalog = state
        .orchestrator
        .set_phase_toggle(index, req.requires_approval, req.enabled)?;
    Ok(Json(catalog.resolve(index)))
}
