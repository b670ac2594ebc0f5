//! Artifact store
//!
//! Named handles for data crossing stage boundaries. Artifacts are keyed by
//! `(stage, slot)`: publishing to a key that already holds an artifact replaces
//! it, so re-running a stage never accumulates stale outputs.

use convoy_core::domain::artifact::{Artifact, ArtifactKind, ArtifactRef};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' has not been published")]
    NotFound(ArtifactRef),

    #[error("artifact '{reference}' is {found}, expected {expected}")]
    WrongKind {
        reference: ArtifactRef,
        expected: ArtifactKind,
        found: ArtifactKind,
    },
}

/// In-process artifact store shared by every action of a run
#[derive(Default)]
pub struct ArtifactStore {
    artifacts: RwLock<HashMap<ArtifactRef, Artifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a set of artifacts atomically
    ///
    /// Readers see either all of them or none of them. Must complete before
    /// the producing action is reported as succeeded.
    pub async fn publish(&self, batch: Vec<Artifact>) {
        if batch.is_empty() {
            return;
        }

        let mut artifacts = self.artifacts.write().await;
        for artifact in batch {
            debug!(
                "Publishing artifact {} ({}, version {})",
                artifact.reference,
                artifact.kind(),
                artifact.version
            );
            artifacts.insert(artifact.reference.clone(), artifact);
        }
    }

    pub async fn get(&self, reference: &ArtifactRef) -> Result<Artifact, ArtifactError> {
        self.artifacts
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(reference.clone()))
    }

    /// Reads an artifact and checks its kind
    pub async fn get_kind(
        &self,
        reference: &ArtifactRef,
        expected: ArtifactKind,
    ) -> Result<Artifact, ArtifactError> {
        let artifact = self.get(reference).await?;
        if artifact.kind() != expected {
            return Err(ArtifactError::WrongKind {
                reference: reference.clone(),
                expected,
                found: artifact.kind(),
            });
        }
        Ok(artifact)
    }

    /// Resolves every reference, failing on the first missing one
    pub async fn resolve_all(
        &self,
        references: &[ArtifactRef],
    ) -> Result<Vec<Artifact>, ArtifactError> {
        let artifacts = self.artifacts.read().await;
        references
            .iter()
            .map(|reference| {
                artifacts
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| ArtifactError::NotFound(reference.clone()))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}
