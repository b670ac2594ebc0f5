//! Pipeline DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::RegisteredPipeline;

/// Request to register a pipeline definition script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub script: String,
}

/// Compact pipeline listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: Uuid,
    pub name: String,
    pub service: String,
    pub description: Option<String>,
    pub stage_count: usize,
    pub environments: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&RegisteredPipeline> for PipelineSummary {
    fn from(pipeline: &RegisteredPipeline) -> Self {
        Self {
            id: pipeline.id,
            name: pipeline.name.clone(),
            service: pipeline.service.clone(),
            description: pipeline.description.clone(),
            stage_count: pipeline.definition.stages.len(),
            environments: pipeline
                .definition
                .environments
                .names()
                .map(str::to_string)
                .collect(),
            created_at: pipeline.created_at,
        }
    }
}
