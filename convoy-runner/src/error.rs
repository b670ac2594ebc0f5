//! Action error taxonomy
//!
//! Each action kind has its own error enum; [`ActionError`] wraps them and
//! classifies every failure into a [`FailureKind`] for the run trail.

use convoy_core::domain::failure::{Failure, FailureKind};
use thiserror::Error;

use crate::artifact_store::ArtifactError;
use crate::lock::LockError;
use crate::runtime::DeployError;
use crate::secrets::SecretError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build commands exited with code {exit_code}")]
    CommandsFailed { exit_code: i32 },

    #[error("execution environment unavailable: {0}")]
    Environment(String),

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error("failed to push {image}: {reason}")]
    Push { image: String, reason: String },

    #[error("manifest '{path}' is unusable: {reason}")]
    Manifest { path: String, reason: String },

    #[error("output '{slot}' needs the '{setting}' setting")]
    MissingSetting { slot: String, setting: &'static str },
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("database '{database}' is already being migrated by {holder}")]
    Conflict { database: String, holder: String },

    #[error("migration lock unavailable: {0}")]
    Lock(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("migration of '{database}' exited with code {exit_code}")]
    CommandsFailed { database: String, exit_code: i32 },

    #[error("execution environment unavailable: {0}")]
    Environment(String),
}

impl MigrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MigrationError::Conflict { .. } => FailureKind::MigrationConflict,
            _ => FailureKind::MigrationFailure,
        }
    }
}

impl From<LockError> for MigrationError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Conflict { database, holder } => MigrationError::Conflict { database, holder },
            LockError::Unavailable(reason) => MigrationError::Lock(reason),
        }
    }
}

/// Failure of a single action
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("{0}")]
    Internal(String),
}

impl ActionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::Artifact(_) | ActionError::Internal(_) => FailureKind::Internal,
            ActionError::Build(_) => FailureKind::BuildFailure,
            ActionError::Migration(e) => e.kind(),
            ActionError::Deploy(e) => e.kind(),
        }
    }

    pub fn into_failure(self, action_id: &str) -> Failure {
        Failure::new(self.kind(), self.to_string()).in_action(action_id)
    }
}
