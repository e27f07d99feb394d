use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::store::{DbHandle, MessageRole, MessageType, Project, WorkflowRun, project_slug};
use crate::workflow::CodeAgentEvent;
use crate::workflow::runner::WorkflowRunner;

pub struct AppState {
    pub db: DbHandle,
    pub runner: WorkflowRunner,
}

pub type SharedState = Arc<AppState>;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSteps {
    pub run_id: String,
    pub steps: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectCreated {
    pub project: Project,
    pub run: WorkflowRun,
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/events/code-agent", post(submit_event))
        .route("/api/projects", post(create_project))
        .route(
            "/api/projects/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/steps", get(get_run_steps))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Validate and queue an event whose project is known to exist.
async fn accept(state: &SharedState, event: CodeAgentEvent) -> Result<WorkflowRun, ApiError> {
    event.validate().map_err(ApiError::BadRequest)?;
    state.runner.submit(event).await.map_err(internal)
}

async fn ensure_project(state: &SharedState, id: &str) -> Result<Project, ApiError> {
    let lookup = id.to_string();
    let project = state
        .db
        .call(move |db| db.get_project(&lookup))
        .await
        .map_err(internal)?;
    project.ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

async fn submit_event(
    State(state): State<SharedState>,
    Json(event): Json<CodeAgentEvent>,
) -> Result<impl IntoResponse, ApiError> {
    event.validate().map_err(ApiError::BadRequest)?;
    ensure_project(&state, &event.project_id).await?;
    let run = accept(&state, event).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// Create a project named after the prompt, store the prompt as its first
/// message, and start a run for it.
async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event = CodeAgentEvent {
        value: req.value,
        project_id: "pending".to_string(),
    };
    event.validate().map_err(ApiError::BadRequest)?;

    let value = event.value.clone();
    let project = state
        .db
        .call(move |db| {
            let project = db.create_project(&project_slug(&value))?;
            db.create_message(&project.id, &value, MessageRole::User, MessageType::Result, None)?;
            Ok(project)
        })
        .await
        .map_err(internal)?;

    let run = accept(
        &state,
        CodeAgentEvent {
            value: event.value,
            project_id: project.id.clone(),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(ProjectCreated { project, run })))
}

async fn create_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event = CodeAgentEvent {
        value: req.value,
        project_id: id,
    };
    event.validate().map_err(ApiError::BadRequest)?;
    ensure_project(&state, &event.project_id).await?;

    let (project_id, value) = (event.project_id.clone(), event.value.clone());
    state
        .db
        .call(move |db| {
            db.create_message(&project_id, &value, MessageRole::User, MessageType::Result, None)
        })
        .await
        .map_err(internal)?;

    let run = accept(&state, event).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_project(&state, &id).await?;
    let messages = state
        .db
        .call(move |db| db.list_messages(&id))
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runner.get_run(&id).await.map_err(internal)?;
    match run {
        Some(run) => Ok(Json(run)),
        None => Err(ApiError::NotFound(format!("Run {} not found", id))),
    }
}

/// Completed step keys of a run, in completion order.
async fn get_run_steps(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = id.clone();
    let steps = state
        .db
        .call(move |db| {
            if db.get_run(&run_id)?.is_none() {
                return Ok(None);
            }
            db.step_keys(&run_id).map(Some)
        })
        .await
        .map_err(internal)?;
    match steps {
        Some(steps) => Ok(Json(RunSteps { run_id: id, steps })),
        None => Err(ApiError::NotFound(format!("Run {} not found", id))),
    }
}
