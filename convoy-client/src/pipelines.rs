//! Pipeline-related API endpoints

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};
use convoy_core::domain::pipeline::RegisteredPipeline;
use convoy_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Management
    // =============================================================================

    /// Register a pipeline definition script
    ///
    /// The orchestrator parses and validates the script; an invalid definition
    /// comes back as a 400 `ApiError` naming the problem.
    ///
    /// # Arguments
    /// * `req` - The pipeline creation request
    ///
    /// # Returns
    /// The registered pipeline with its parsed definition
    ///
    /// # Example
    /// ```no_run
    /// # use convoy_client::OrchestratorClient;
    /// # use convoy_core::dto::pipeline::CreatePipeline;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let pipeline = client.create_pipeline(CreatePipeline {
    ///     script: std::fs::read_to_string("pipeline.lua")?,
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<RegisteredPipeline> {
        if req.script.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "pipeline script is empty".to_string(),
            ));
        }

        let url = format!("{}/api/pipelines", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List all pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/api/pipelines", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a pipeline by ID
    ///
    /// # Arguments
    /// * `pipeline_id` - The pipeline UUID
    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<RegisteredPipeline> {
        let url = format!("{}/api/pipelines/{}", self.base_url, pipeline_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Delete a pipeline together with its runs
    ///
    /// # Arguments
    /// * `pipeline_id` - The pipeline UUID to delete
    pub async fn delete_pipeline(&self, pipeline_id: Uuid) -> Result<()> {
        let url = format!("{}/api/pipelines/{}", self.base_url, pipeline_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
