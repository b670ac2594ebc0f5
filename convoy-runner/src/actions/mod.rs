//! Action execution
//!
//! Dispatches an [`Action`] to its kind-specific implementation. Every
//! implementation publishes its outputs before returning `Ok`, so the
//! sequencer can mark it succeeded knowing downstream stages will see them.

mod build;
mod deploy;
mod migrate;

use convoy_core::domain::action::{Action, ActionSpec};
use convoy_core::domain::artifact::{ArtifactKind, ArtifactRef, SourceBundle};
use convoy_core::domain::pipeline::Pipeline;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::artifact_store::ArtifactStore;
use crate::context::RunContext;
use crate::error::ActionError;
use crate::sequencer::Engine;

/// Everything an action needs from its run
#[derive(Clone)]
pub struct ActionContext {
    pub run: Arc<RunContext>,
    pub engine: Engine,
    pub pipeline: Arc<Pipeline>,
    /// Artifacts of this run
    pub artifacts: Arc<ArtifactStore>,
    /// Source revision the run is pinned to
    pub revision: String,
    /// Container image for actions that do not name one
    pub default_image: String,
}

impl ActionContext {
    /// The checked-out source of this run
    pub async fn source(&self) -> Result<SourceBundle, ActionError> {
        let artifact = self
            .artifacts
            .get_kind(&ArtifactRef::source(), ArtifactKind::Source)
            .await?;
        artifact
            .as_source()
            .cloned()
            .ok_or_else(|| ActionError::Internal("source artifact has no bundle".to_string()))
    }
}

/// Executes one action to completion
pub async fn execute(ctx: &ActionContext, action: &Action) -> Result<(), ActionError> {
    match &action.spec {
        ActionSpec::Build(spec) => build::execute(ctx, action, spec).await,
        ActionSpec::Migrate(spec) => migrate::execute(ctx, action, spec).await,
        ActionSpec::Deploy(spec) => deploy::execute(ctx, action, spec).await,
    }
}

/// Per-action concurrency limits shared by every run of an engine
///
/// Keyed by pipeline name and action id. Migrations do not go through here:
/// their exclusivity is the migration lock, which fails fast instead of
/// waiting.
#[derive(Default)]
pub struct ConcurrencyLimits {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for a slot of `action` in `pipeline`
    pub async fn acquire(
        &self,
        pipeline: &str,
        action: &Action,
    ) -> Result<OwnedSemaphorePermit, ActionError> {
        let semaphore = {
            let mut semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                semaphores
                    .entry(format!("{}/{}", pipeline, action.id))
                    .or_insert_with(|| {
                        Arc::new(Semaphore::new(action.concurrency_limit.max(1) as usize))
                    }),
            )
        };

        semaphore
            .acquire_owned()
            .await
            .map_err(|_| ActionError::Internal(format!("concurrency limit of '{}' closed", action.id)))
    }
}
