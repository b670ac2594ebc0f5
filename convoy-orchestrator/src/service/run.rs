//! Run Service
//!
//! Business logic for queuing, inspecting and cancelling runs.

use convoy_core::domain::failure::{Failure, FailureKind};
use convoy_core::domain::pipeline::{Pipeline, PipelineDefinition, TopologyError};
use convoy_core::domain::run::{PipelineRun, RunStatus, RunTrail};
use convoy_core::dto::run::CreateRun;
use sqlx::PgPool;
use uuid::Uuid;

use crate::repository::{pipeline_repository, run_repository};
use crate::scheduler::RunCancellations;

/// Service error type
#[derive(Debug)]
pub enum RunError {
    NotFound(Uuid),
    PipelineNotFound(Uuid),
    InvalidState(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        RunError::DatabaseError(err)
    }
}

/// Queue a run of a pipeline against an environment
///
/// The environment's branch is resolved here and stored with the run; it
/// does not change afterwards.
pub async fn queue_run(
    pool: &PgPool,
    pipeline_id: Uuid,
    req: CreateRun,
) -> Result<PipelineRun, RunError> {
    let registered = pipeline_repository::find_by_id(pool, pipeline_id)
        .await?
        .ok_or(RunError::PipelineNotFound(pipeline_id))?;

    let pipeline = registered
        .definition
        .instantiate(&req.environment)
        .map_err(|e| RunError::ValidationError(e.to_string()))?;

    let run = run_repository::create(
        pool,
        pipeline_id,
        &pipeline.environment().name,
        pipeline.branch(),
        RunTrail::pending(&pipeline),
    )
    .await?;

    tracing::info!(
        "Run {} queued for pipeline {} (environment {}, branch {})",
        run.id,
        registered.name,
        run.environment,
        run.branch
    );

    Ok(run)
}

/// Get a run by ID
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<PipelineRun, RunError> {
    let run = run_repository::find_by_id(pool, id)
        .await?
        .ok_or(RunError::NotFound(id))?;

    Ok(run)
}

/// List runs, optionally restricted to one pipeline
pub async fn list_runs(
    pool: &PgPool,
    pipeline_id: Option<Uuid>,
) -> Result<Vec<PipelineRun>, RunError> {
    let runs = match pipeline_id {
        Some(pipeline_id) => {
            pipeline_repository::find_by_id(pool, pipeline_id)
                .await?
                .ok_or(RunError::PipelineNotFound(pipeline_id))?;
            run_repository::find_by_pipeline(pool, pipeline_id).await?
        }
        None => run_repository::list_all(pool).await?,
    };

    Ok(runs)
}

/// Cancel a run
///
/// A queued run is cancelled on the spot. A running run has its abort signal
/// raised: actions already in flight finish, nothing new starts, and the run
/// ends `Cancelled` once the sequencer notices.
pub async fn cancel_run(
    pool: &PgPool,
    cancellations: &RunCancellations,
    id: Uuid,
) -> Result<PipelineRun, RunError> {
    let run = get_run(pool, id).await?;

    match run.status {
        RunStatus::Queued => {
            let cause = Failure::new(FailureKind::Cancelled, "cancelled before it started");
            if !run_repository::cancel_queued(pool, id, &cause).await? && !cancellations.raise(id) {
                return Err(RunError::InvalidState(format!(
                    "Run {} finished before it could be cancelled",
                    id
                )));
            }
        }
        RunStatus::Running => {
            if !cancellations.raise(id) {
                return Err(RunError::InvalidState(format!(
                    "Run {} is not executing in this orchestrator",
                    id
                )));
            }
        }
        status => {
            return Err(RunError::InvalidState(format!(
                "Cannot cancel run {} in state {:?}",
                id, status
            )));
        }
    }

    tracing::info!("Cancellation requested for run {}", id);
    get_run(pool, id).await
}

/// Binds a stored definition to a run's environment, keeping the branch that
/// was resolved when the run was queued
pub fn bind_pipeline(
    definition: &PipelineDefinition,
    run: &PipelineRun,
) -> Result<Pipeline, TopologyError> {
    let mut environment = definition.environments.resolve(&run.environment)?;
    environment.branch = run.branch.clone();

    Pipeline::new(
        definition.name.clone(),
        definition.service.clone(),
        definition.source.clone(),
        environment,
        definition.stages.clone(),
    )
}
