//! Pipeline Repository
//!
//! Handles all database operations related to registered pipelines.

use convoy_core::domain::pipeline::{PipelineDefinition, RegisteredPipeline};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

/// Stores a parsed definition together with the script it came from
pub async fn create(
    pool: &PgPool,
    script: String,
    definition: PipelineDefinition,
) -> Result<RegisteredPipeline, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now();

    let pipeline = RegisteredPipeline {
        id,
        name: definition.name.clone(),
        service: definition.service.clone(),
        description: definition.description.clone(),
        script,
        definition,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO pipelines (
            id, name, service, description, script, definition, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(&pipeline.name)
    .bind(&pipeline.service)
    .bind(&pipeline.description)
    .bind(&pipeline.script)
    .bind(Json(&pipeline.definition))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(pipeline)
}

/// Find a pipeline by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<RegisteredPipeline>, sqlx::Error> {
    let row = sqlx::query_as::<_, PipelineRow>(
        r#"
        SELECT id, name, service, description, script, definition, created_at, updated_at
        FROM pipelines
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List all pipelines
pub async fn list_all(pool: &PgPool) -> Result<Vec<RegisteredPipeline>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PipelineRow>(
        r#"
        SELECT id, name, service, description, script, definition, created_at, updated_at
        FROM pipelines
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Delete a pipeline by ID; its runs and their logs go with it
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    name: String,
    service: String,
    description: Option<String>,
    script: String,
    definition: Json<PipelineDefinition>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<PipelineRow> for RegisteredPipeline {
    fn from(row: PipelineRow) -> Self {
        RegisteredPipeline {
            id: row.id,
            name: row.name,
            service: row.service,
            description: row.description,
            script: row.script,
            definition: row.definition.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
