//! Run API Handlers
//!
//! HTTP endpoints for queuing and inspecting pipeline runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use convoy_core::domain::log::LogEntry;
use convoy_core::domain::run::PipelineRun;
use convoy_core::dto::run::{CreateRun, RunSummary};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::{log_service, run_service};

/// POST /api/pipelines/{id}/runs
/// Queue a run of a pipeline against an environment
pub async fn queue_run(
    State(pool): State<PgPool>,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<CreateRun>,
) -> ApiResult<(StatusCode, Json<PipelineRun>)> {
    tracing::info!(
        "Queuing run of pipeline {} for environment {}",
        pipeline_id,
        req.environment
    );

    let run = run_service::queue_run(&pool, pipeline_id, req).await?;

    Ok((StatusCode::ACCEPTED, Json(run)))
}

#[derive(Debug, Deserialize)]
pub struct RunFilter {
    pub pipeline: Option<Uuid>,
}

/// GET /api/runs
/// List runs, optionally of a single pipeline (`?pipeline=<id>`)
pub async fn list_runs(
    State(pool): State<PgPool>,
    Query(filter): Query<RunFilter>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs (pipeline: {:?})", filter.pipeline);

    let runs = run_service::list_runs(&pool, filter.pipeline).await?;

    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

/// GET /api/runs/{id}
/// Get run status, branch, stage trail and cause
pub async fn get_run(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    let run = run_service::get_run(&pool, id).await?;

    Ok(Json(run))
}

/// GET /api/runs/{id}/logs
/// Get all stored log entries of a run
pub async fn get_run_logs(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    tracing::debug!("Getting logs for run: {}", id);

    let logs = log_service::get_run_logs(&pool, id).await?;

    Ok(Json(logs))
}

/// POST /api/runs/{id}/cancel
/// Cancel a queued or running run
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::info!("Cancelling run: {}", id);

    let run = run_service::cancel_run(&state.pool, &state.cancellations, id).await?;

    Ok(Json(run))
}
