//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod pipeline;
pub mod run;
pub mod runtime;

use axum::{
    Router,
    extract::FromRef,
    routing::{get, post},
};
use convoy_runner::runtime::RuntimeRegistry;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::scheduler::RunCancellations;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub runtimes: Arc<RuntimeRegistry>,
    pub cancellations: Arc<RunCancellations>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<RuntimeRegistry> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.runtimes)
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route(
            "/api/pipelines",
            get(pipeline::list_pipelines).post(pipeline::create_pipeline),
        )
        .route(
            "/api/pipelines/{id}",
            get(pipeline::get_pipeline).delete(pipeline::delete_pipeline),
        )
        .route("/api/pipelines/{id}/runs", post(run::queue_run))
        // Run endpoints
        .route("/api/runs", get(run::list_runs))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/runs/{id}/logs", get(run::get_run_logs))
        .route("/api/runs/{id}/cancel", post(run::cancel_run))
        // Service runtime endpoints
        .route("/api/services", get(runtime::list_runtimes))
        .route(
            "/api/services/{service}/{environment}",
            get(runtime::get_runtime),
        )
        .route(
            "/api/services/{service}/{environment}/metrics",
            post(runtime::observe_metric),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
