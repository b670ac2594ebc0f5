//! Failure taxonomy
//!
//! Every action failure is classified into a [`FailureKind`]. The first failure
//! of a run becomes its cause and is reported to the operator verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a run or action failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Source could not be retrieved; nothing ran
    SourceUnavailable,
    /// A build failed; its artifacts were not published
    BuildFailure,
    /// Another migration holds the database lock
    MigrationConflict,
    /// The migration itself failed
    MigrationFailure,
    /// Health checks did not pass within the grace window; rolled back
    DeployHealthCheckTimeout,
    /// Rollback did not converge; operator intervention required
    RollbackFailed,
    /// Deploy failed for a reason other than health checks
    DeployFailure,
    /// The run was cancelled before it finished
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "SourceUnavailable",
            FailureKind::BuildFailure => "BuildFailure",
            FailureKind::MigrationConflict => "MigrationConflict",
            FailureKind::MigrationFailure => "MigrationFailure",
            FailureKind::DeployHealthCheckTimeout => "DeployHealthCheckTimeout",
            FailureKind::RollbackFailed => "RollbackFailed",
            FailureKind::DeployFailure => "DeployFailure",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Internal => "Internal",
        }
    }

    /// Whether an operator has to step in before the service is trusted again
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            FailureKind::MigrationConflict | FailureKind::RollbackFailed
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Action that failed; `None` for run-level failures such as source retrieval
    pub action_id: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            action_id: None,
            message: message.into(),
        }
    }

    pub fn in_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action_id {
            Some(action) => write!(f, "{} in '{}': {}", self.kind, action, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
