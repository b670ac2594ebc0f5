//! Pipeline Service
//!
//! Business logic for pipeline registration. A definition is only stored once
//! it parses and validates as a topology.

use convoy_core::domain::pipeline::{PipelineDefinition, RegisteredPipeline};
use convoy_core::dto::pipeline::CreatePipeline;
use sqlx::PgPool;
use uuid::Uuid;

use crate::repository::pipeline_repository;

/// Service error type
#[derive(Debug)]
pub enum PipelineError {
    NotFound(Uuid),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Register a new pipeline
pub async fn create_pipeline(pool: &PgPool, req: CreatePipeline) -> Result<RegisteredPipeline> {
    let definition = validate_pipeline_request(&req)?;

    let pipeline = pipeline_repository::create(pool, req.script, definition).await?;

    tracing::info!(
        "Pipeline registered: {} ({}) for service {}",
        pipeline.name,
        pipeline.id,
        pipeline.service
    );

    Ok(pipeline)
}

/// Get a pipeline by ID
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<RegisteredPipeline> {
    let pipeline = pipeline_repository::find_by_id(pool, id)
        .await?
        .ok_or(PipelineError::NotFound(id))?;

    Ok(pipeline)
}

/// List all pipelines
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<RegisteredPipeline>> {
    let pipelines = pipeline_repository::list_all(pool).await?;
    Ok(pipelines)
}

/// Delete a pipeline
pub async fn delete_pipeline(pool: &PgPool, id: Uuid) -> Result<()> {
    let deleted = pipeline_repository::delete(pool, id).await?;

    if !deleted {
        return Err(PipelineError::NotFound(id));
    }

    tracing::info!("Pipeline deleted: {}", id);

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<PipelineDefinition> {
    if req.script.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline script cannot be empty".to_string(),
        ));
    }

    let definition = convoy_lua::parse_pipeline_definition(&req.script)
        .map_err(|e| PipelineError::ValidationError(format!("Invalid pipeline: {:#}", e)))?;

    if definition.name.len() > 255 {
        return Err(PipelineError::ValidationError(
            "Pipeline name is too long (max 255 characters)".to_string(),
        ));
    }

    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(script: &str) -> CreatePipeline {
        CreatePipeline {
            script: script.to_string(),
        }
    }

    #[test]
    fn test_validate_empty_script() {
        let result = validate_pipeline_request(&request("  "));
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_invalid_topology() {
        let script = r#"
            return pipeline.define {
                name = "svc-deploy",
                service = "svc",
                source = { repository = "https://git.example.com/svc.git" },
                stages = {
                    pipeline.stage {
                        name = "deploy",
                        actions = { pipeline.deploy { id = "rollout", image = "build/image" } },
                    },
                },
            }
        "#;

        let result = validate_pipeline_request(&request(script));
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[test]
    fn test_validate_valid_request() {
        let script = r#"
            return pipeline.define {
                name = "svc-deploy",
                service = "svc",
                source = { repository = "https://git.example.com/svc.git" },
                environments = {
                    dev = { branch = "dev" },
                },
                stages = {
                    pipeline.stage {
                        name = "build",
                        actions = {
                            pipeline.build {
                                id = "image",
                                commands = { "make test" },
                                outputs = { image = "image-ref" },
                                image = { repository = "registry/svc" },
                            },
                        },
                    },
                    pipeline.stage {
                        name = "deploy",
                        actions = { pipeline.deploy { id = "rollout", image = "build/image" } },
                    },
                },
            }
        "#;

        let definition = validate_pipeline_request(&request(script)).unwrap();
        assert_eq!(definition.service, "svc");
        assert_eq!(definition.stages.len(), 2);
    }
}
