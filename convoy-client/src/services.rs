//! Service runtime API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use convoy_core::domain::runtime::{MetricDimension, RuntimeSnapshot, ScalingDecision};
use convoy_core::dto::service::ObserveMetric;

impl OrchestratorClient {
    // =============================================================================
    // Service Runtimes
    // =============================================================================

    /// List every runtime hosted by the orchestrator
    pub async fn list_services(&self) -> Result<Vec<RuntimeSnapshot>> {
        let url = format!("{}/api/services", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the snapshot of one runtime
    pub async fn get_service(&self, service: &str, environment: &str) -> Result<RuntimeSnapshot> {
        let url = format!(
            "{}/api/services/{}/{}",
            self.base_url, service, environment
        );
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Feed a utilization sample to a runtime's autoscaling policy
    ///
    /// # Arguments
    /// * `dimension` - CPU or memory
    /// * `utilization` - Percent of allocated capacity
    ///
    /// # Returns
    /// What the policy decided for this sample
    pub async fn observe_metric(
        &self,
        service: &str,
        environment: &str,
        dimension: MetricDimension,
        utilization: f64,
    ) -> Result<ScalingDecision> {
        let url = format!(
            "{}/api/services/{}/{}/metrics",
            self.base_url, service, environment
        );
        let response = self
            .client
            .post(&url)
            .json(&ObserveMetric {
                dimension,
                utilization,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }
}
