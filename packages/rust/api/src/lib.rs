//! HTTP control surface for the ingestion pipeline.
//!
//! Thin axum handlers over [`IngestionCoordinator`]: every route maps to one
//! coordinator operation, and every error becomes a JSON `{ "error": ... }` body.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use regwatch_core::{IngestionCoordinator, PipelineStats, RunReport};
use regwatch_shared::{PipelineRun, RegwatchError, RunId, RunKind, Stage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`RegwatchError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub RegwatchError);

impl From<RegwatchError> for ApiError {
    fn from(err: RegwatchError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RegwatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            RegwatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RegwatchError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(coordinator: IngestionCoordinator) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/jobs", get(jobs))
        .route("/backfill", post(full_run))
        .route("/backfill/{stage}", post(backfill))
        .route("/update", post(update))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/cancel", post(cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(coordinator)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(coordinator: IngestionCoordinator, addr: &str) -> regwatch_shared::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RegwatchError::io(addr, e))?;
    info!(%addr, "control API listening");
    axum::serve(listener, router(coordinator))
        .await
        .map_err(|e| RegwatchError::io(addr, e))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    run_id: Option<RunId>,
}

#[derive(Debug, Default, Deserialize)]
struct BackfillQuery {
    #[serde(default)]
    missing_only: bool,
}

#[derive(Debug, Serialize)]
struct Started {
    run_id: RunId,
    kind: RunKind,
}

async fn status(
    State(coord): State<IngestionCoordinator>,
    Query(q): Query<RunQuery>,
) -> ApiResult<Json<RunReport>> {
    Ok(Json(coord.status(q.run_id).await?))
}

async fn stats(State(coord): State<IngestionCoordinator>) -> ApiResult<Json<PipelineStats>> {
    Ok(Json(coord.stats().await?))
}

async fn jobs(State(coord): State<IngestionCoordinator>) -> ApiResult<Json<Vec<PipelineRun>>> {
    Ok(Json(coord.jobs().await?))
}

async fn start(coord: &IngestionCoordinator, kind: RunKind) -> ApiResult<(StatusCode, Json<Started>)> {
    let run_id = coord.start(kind).await?;
    Ok((StatusCode::ACCEPTED, Json(Started { run_id, kind })))
}

async fn full_run(State(coord): State<IngestionCoordinator>) -> ApiResult<(StatusCode, Json<Started>)> {
    start(&coord, RunKind::Full).await
}

async fn update(State(coord): State<IngestionCoordinator>) -> ApiResult<(StatusCode, Json<Started>)> {
    start(&coord, RunKind::Incremental).await
}

async fn backfill(
    State(coord): State<IngestionCoordinator>,
    Path(stage): Path<String>,
    Query(q): Query<BackfillQuery>,
) -> ApiResult<(StatusCode, Json<Started>)> {
    let stage: Stage = stage.parse()?;
    start(
        &coord,
        RunKind::Backfill {
            stage,
            missing_only: q.missing_only,
        },
    )
    .await
}

async fn pause(
    State(coord): State<IngestionCoordinator>,
    Query(q): Query<RunQuery>,
) -> ApiResult<Json<PipelineRun>> {
    Ok(Json(coord.pause(q.run_id).await?))
}

async fn resume(
    State(coord): State<IngestionCoordinator>,
    Query(q): Query<RunQuery>,
) -> ApiResult<Json<PipelineRun>> {
    Ok(Json(coord.resume(q.run_id).await?))
}

async fn cancel(
    State(coord): State<IngestionCoordinator>,
    Query(q): Query<RunQuery>,
) -> ApiResult<Json<PipelineRun>> {
    Ok(Json(coord.cancel(q.run_id).await?))
}
