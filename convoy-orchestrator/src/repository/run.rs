//! Run Repository
//!
//! Handles all database operations related to pipeline runs.

use convoy_core::domain::failure::Failure;
use convoy_core::domain::run::{PipelineResult, PipelineRun, RunStatus, RunTrail};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, pipeline_id, environment, branch, status, revision, trail, cause, \
                           requested_at, started_at, completed_at";

/// Queue a new run with its branch already resolved
pub async fn create(
    pool: &PgPool,
    pipeline_id: Uuid,
    environment: &str,
    branch: &str,
    trail: RunTrail,
) -> Result<PipelineRun, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now();

    let run = PipelineRun {
        id,
        pipeline_id,
        environment: environment.to_string(),
        branch: branch.to_string(),
        status: RunStatus::Queued,
        revision: None,
        trail,
        cause: None,
        requested_at: now,
        started_at: None,
        completed_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO runs (id, pipeline_id, environment, branch, status, trail, requested_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(pipeline_id)
    .bind(environment)
    .bind(branch)
    .bind(status_to_string(RunStatus::Queued))
    .bind(Json(&run.trail))
    .bind(now)
    .execute(pool)
    .await?;

    Ok(run)
}

/// Find a run by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRun>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE id = $1",
        RUN_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Oldest queued runs first
pub async fn find_queued(pool: &PgPool, limit: i64) -> Result<Vec<PipelineRun>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE status = $1 ORDER BY requested_at ASC LIMIT $2",
        RUN_COLUMNS
    ))
    .bind(status_to_string(RunStatus::Queued))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Find runs of a pipeline, newest first
pub async fn find_by_pipeline(
    pool: &PgPool,
    pipeline_id: Uuid,
) -> Result<Vec<PipelineRun>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE pipeline_id = $1 ORDER BY requested_at DESC",
        RUN_COLUMNS
    ))
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// List all runs, newest first
pub async fn list_all(pool: &PgPool) -> Result<Vec<PipelineRun>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs ORDER BY requested_at DESC",
        RUN_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Moves a run from `Queued` to `Running`
///
/// Returns false when the run was no longer queued (claimed elsewhere or
/// cancelled), in which case nothing changed.
pub async fn claim(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, started_at = $2
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(status_to_string(RunStatus::Running))
    .bind(chrono::Utc::now())
    .bind(id)
    .bind(status_to_string(RunStatus::Queued))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Replaces the stored trail of a running run
pub async fn update_trail(
    pool: &PgPool,
    id: Uuid,
    trail: &RunTrail,
    revision: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runs
        SET trail = $1, revision = COALESCE($2, revision)
        WHERE id = $3
        "#,
    )
    .bind(Json(trail))
    .bind(revision)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Records the final outcome of a run
pub async fn complete(pool: &PgPool, id: Uuid, result: &PipelineResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, revision = $2, trail = $3, cause = $4, completed_at = $5
        WHERE id = $6
        "#,
    )
    .bind(status_to_string(result.status))
    .bind(&result.revision)
    .bind(Json(&result.trail))
    .bind(result.cause.as_ref().map(Json))
    .bind(chrono::Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fails a run that could not be started, e.g. because its definition no
/// longer binds to the environment
pub async fn fail(pool: &PgPool, id: Uuid, cause: &Failure) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, cause = $2, completed_at = $3
        WHERE id = $4
        "#,
    )
    .bind(status_to_string(RunStatus::Failed))
    .bind(Json(cause))
    .bind(chrono::Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Cancels a run that has not been claimed yet
pub async fn cancel_queued(pool: &PgPool, id: Uuid, cause: &Failure) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, cause = $2, completed_at = $3
        WHERE id = $4 AND status = $5
        "#,
    )
    .bind(status_to_string(RunStatus::Cancelled))
    .bind(Json(cause))
    .bind(chrono::Utc::now())
    .bind(id)
    .bind(status_to_string(RunStatus::Queued))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "Queued",
        RunStatus::Running => "Running",
        RunStatus::Succeeded => "Succeeded",
        RunStatus::Failed => "Failed",
        RunStatus::Cancelled => "Cancelled",
    }
}

fn string_to_status(s: &str) -> RunStatus {
    match s {
        "Queued" => RunStatus::Queued,
        "Running" => RunStatus::Running,
        "Succeeded" => RunStatus::Succeeded,
        "Cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_id: Uuid,
    environment: String,
    branch: String,
    status: String,
    revision: Option<String>,
    trail: Json<RunTrail>,
    cause: Option<Json<Failure>>,
    requested_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<RunRow> for PipelineRun {
    fn from(row: RunRow) -> Self {
        PipelineRun {
            id: row.id,
            pipeline_id: row.pipeline_id,
            environment: row.environment,
            branch: row.branch,
            status: string_to_status(&row.status),
            revision: row.revision,
            trail: row.trail.0,
            cause: row.cause.map(|cause| cause.0),
            requested_at: row.requested_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(string_to_status(status_to_string(status)), status);
        }
    }
}
