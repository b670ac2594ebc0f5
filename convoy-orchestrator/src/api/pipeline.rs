//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline registration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use convoy_core::domain::pipeline::RegisteredPipeline;
use convoy_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use sqlx::PgPool;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::service::pipeline_service;

/// POST /api/pipelines
/// Register a pipeline definition script
pub async fn create_pipeline(
    State(pool): State<PgPool>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<RegisteredPipeline>)> {
    tracing::info!("Registering pipeline ({} bytes of script)", req.script.len());

    let pipeline = pipeline_service::create_pipeline(&pool, req).await?;

    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /api/pipelines
/// List all pipelines
pub async fn list_pipelines(State(pool): State<PgPool>) -> ApiResult<Json<Vec<PipelineSummary>>> {
    tracing::debug!("Listing all pipelines");

    let pipelines = pipeline_service::list_pipelines(&pool).await?;

    Ok(Json(pipelines.iter().map(PipelineSummary::from).collect()))
}

/// GET /api/pipelines/{id}
/// Get pipeline by ID
pub async fn get_pipeline(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RegisteredPipeline>> {
    tracing::debug!("Getting pipeline: {}", id);

    let pipeline = pipeline_service::get_pipeline(&pool, id).await?;

    Ok(Json(pipeline))
}

/// DELETE /api/pipelines/{id}
/// Delete a pipeline together with its runs
pub async fn delete_pipeline(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", id);

    pipeline_service::delete_pipeline(&pool, id).await?;

    Ok(StatusCode::NO_CONTENT)
}
