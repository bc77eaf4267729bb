//! Read-only Axum status API over engine records.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::stages::{Stage, STAGES};
use crate::types::{Project, ProjectIndex};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<Project>,
}

#[derive(Serialize)]
pub struct ProjectResponse {
    pub project: Project,
    pub stage: Option<&'static Stage>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: EngineError) -> Response {
    let status = match e {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        ref e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stages", get(get_stages))
        .route("/projects", get(get_all_projects))
        .route("/projects/:id", get(get_project))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /stages`
///
/// The stage catalog with each stage's activities.
pub async fn get_stages() -> impl IntoResponse {
    Json(&STAGES[..])
}

/// `GET /projects`
pub async fn get_all_projects(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.projects().await {
        Ok(projects) => {
            let count = projects.len();
            (StatusCode::OK, Json(ProjectsResponse { count, projects })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:id`
///
/// Returns the project together with the catalog entry of its current stage.
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<ProjectIndex>,
) -> Response {
    match state.engine.project(id).await {
        Ok(project) => {
            let stage = crate::stages::stage(project.stage);
            (StatusCode::OK, Json(ProjectResponse { project, stage })).into_response()
        }
        Err(e) => error_response(e),
    }
}
