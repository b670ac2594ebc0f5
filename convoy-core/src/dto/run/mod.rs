//! Run DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::failure::Failure;
use crate::domain::run::{PipelineRun, RunStatus};

/// Request to queue a run of a registered pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRun {
    pub environment: String,
}

/// Compact run listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub environment: String,
    pub branch: String,
    pub status: RunStatus,
    pub revision: Option<String>,
    pub cause: Option<Failure>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id,
            pipeline_id: run.pipeline_id,
            environment: run.environment.clone(),
            branch: run.branch.clone(),
            status: run.status,
            revision: run.revision.clone(),
            cause: run.cause.clone(),
            requested_at: run.requested_at,
            completed_at: run.completed_at,
        }
    }
}
