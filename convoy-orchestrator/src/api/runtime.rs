//! Service Runtime API Handlers
//!
//! HTTP endpoints for runtime status and utilization samples.

use axum::{
    Json,
    extract::{Path, State},
};
use convoy_core::domain::runtime::{RuntimeSnapshot, ScalingDecision};
use convoy_core::dto::service::ObserveMetric;
use convoy_runner::runtime::RuntimeRegistry;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::service::runtime_service;

/// GET /api/services
/// List every runtime hosted by this orchestrator
pub async fn list_runtimes(
    State(runtimes): State<Arc<RuntimeRegistry>>,
) -> Json<Vec<RuntimeSnapshot>> {
    Json(runtime_service::list_runtimes(&runtimes).await)
}

/// GET /api/services/{service}/{environment}
/// Get the snapshot of one runtime
pub async fn get_runtime(
    State(runtimes): State<Arc<RuntimeRegistry>>,
    Path((service, environment)): Path<(String, String)>,
) -> ApiResult<Json<RuntimeSnapshot>> {
    tracing::debug!("Getting runtime {}/{}", service, environment);

    let snapshot = runtime_service::get_runtime(&runtimes, &service, &environment).await?;

    Ok(Json(snapshot))
}

/// POST /api/services/{service}/{environment}/metrics
/// Feed a utilization sample to the runtime's autoscaling policy
pub async fn observe_metric(
    State(runtimes): State<Arc<RuntimeRegistry>>,
    Path((service, environment)): Path<(String, String)>,
    Json(metric): Json<ObserveMetric>,
) -> ApiResult<Json<ScalingDecision>> {
    let decision =
        runtime_service::observe_metric(&runtimes, &service, &environment, metric).await?;

    Ok(Json(decision))
}
