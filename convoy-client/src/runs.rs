//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};
use convoy_core::domain::log::LogEntry;
use convoy_core::domain::run::PipelineRun;
use convoy_core::dto::run::{CreateRun, RunSummary};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Runs
    // =============================================================================

    /// Queue a run of a pipeline against an environment
    ///
    /// The returned run carries the branch the environment resolved to.
    ///
    /// # Example
    /// ```no_run
    /// # use convoy_client::OrchestratorClient;
    /// # use convoy_core::dto::run::CreateRun;
    /// # use uuid::Uuid;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let run = client.queue_run(Uuid::new_v4(), CreateRun {
    ///     environment: "dev".to_string(),
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn queue_run(&self, pipeline_id: Uuid, req: CreateRun) -> Result<PipelineRun> {
        if req.environment.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "environment name is empty".to_string(),
            ));
        }

        let url = format!("{}/api/pipelines/{}/runs", self.base_url, pipeline_id);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List runs, newest first, optionally of a single pipeline
    pub async fn list_runs(&self, pipeline_id: Option<Uuid>) -> Result<Vec<RunSummary>> {
        let url = format!("{}/api/runs", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(pipeline_id) = pipeline_id {
            request = request.query(&[("pipeline", pipeline_id.to_string())]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a run with its stage trail and cause
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the stored log entries of a run
    pub async fn get_run_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        let url = format!("{}/api/runs/{}/logs", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Cancel a queued or running run
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let url = format!("{}/api/runs/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
