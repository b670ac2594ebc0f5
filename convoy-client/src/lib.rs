//! Convoy HTTP Client
//!
//! A type-safe HTTP client for the Convoy orchestrator API, used by the CLI.
//!
//! # Example
//!
//! ```no_run
//! use convoy_client::OrchestratorClient;
//! use convoy_core::dto::pipeline::CreatePipeline;
//! use convoy_core::dto::run::CreateRun;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let script = std::fs::read_to_string("pipeline.lua")?;
//!     let pipeline = client.create_pipeline(CreatePipeline { script }).await?;
//!
//!     let run = client
//!         .queue_run(pipeline.id, CreateRun { environment: "dev".to_string() })
//!         .await?;
//!     println!("Queued run {} on branch {}", run.id, run.branch);
//!     Ok(())
//! }
//! ```

pub mod error;
mod pipelines;
mod runs;
mod services;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Convoy orchestrator API
///
/// Methods are organized into logical groups:
/// - Pipeline registration (create, list, get, delete)
/// - Runs (queue, list, inspect, logs, cancel)
/// - Service runtimes (status, utilization samples)
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the orchestrator API (e.g., "http://localhost:8080")
    ///
    /// # Example
    /// ```
    /// use convoy_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Create a client around a preconfigured reqwest `Client` (timeouts, TLS)
    ///
    /// # Example
    /// ```
    /// use convoy_client::OrchestratorClient;
    /// use reqwest::Client;
    /// use std::time::Duration;
    ///
    /// let http_client = Client::builder()
    ///     .timeout(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    ///
    /// let client = OrchestratorClient::with_client("http://localhost:8080", http_client);
    /// ```
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turns a non-2xx response into `ClientError::ApiError`
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        } else {
            error_message(&body)
        };

        Err(ClientError::api_error(status.as_u16(), message))
    }

    /// Checks the status and deserializes the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Checks the status of a response without a body (e.g. DELETE)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await.map(|_| ())
    }
}

/// Extracts the message of an `{ "error": "..." }` body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
