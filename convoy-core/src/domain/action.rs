//! Action domain types
//!
//! An action is the unit the sequencer schedules. Its kind-specific settings
//! live in [`ActionSpec`]; everything the sequencer needs to reason about
//! ordering (inputs, outputs, concurrency) is on [`Action`] itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::artifact::{ArtifactKind, ArtifactRef, OutputSlot};

/// Default parallelism for a build action across concurrent runs
pub const DEFAULT_BUILD_CONCURRENCY: u32 = 4;

/// Default health-check grace period for deploys, in seconds
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 300;

/// Kind of action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Build,
    Migrate,
    Deploy,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Build => write!(f, "build"),
            ActionKind::Migrate => write!(f, "migrate"),
            ActionKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// Isolated execution environment of an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnv {
    /// Container image the commands run in (runner default when absent)
    pub container: Option<String>,
    /// Shell commands, run in order inside the container
    pub commands: Vec<String>,
    /// Plain (non-secret) environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Opaque reference to a secret held by the secret store
///
/// Only the name travels through topology, logs and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret:{}", self.0)
    }
}

/// Container image produced by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuild {
    /// Registry-qualified repository, tagged with the source revision
    pub repository: String,
    pub dockerfile: String,
    /// Build context, relative to the source checkout
    pub context: String,
    pub push: bool,
}

/// Build settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub image: Option<ImageBuild>,
    /// JSON manifest written by the commands, relative to the checkout
    pub manifest_path: Option<String>,
}

/// Migration settings
///
/// Names are as written in the definition. Every environment migrates its own
/// copy of the database; see [`MigrationSpec::scoped`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSpec {
    /// Identity of the target database; the exclusivity lock is keyed by it
    pub database: String,
    /// Connection parameters
    pub secret: SecretRef,
}

impl MigrationSpec {
    /// The database and secret this migration targets in `environment`
    ///
    /// `svc-db` with secret `svc-db-credentials` becomes `svc-db.prod` and
    /// `svc-db-credentials.prod` in `prod`.
    pub fn scoped(&self, environment: &str) -> MigrationSpec {
        MigrationSpec {
            database: format!("{}.{}", self.database, environment),
            secret: SecretRef(format!("{}.{}", self.secret.0, environment)),
        }
    }
}

/// Deploy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Artifact holding the image descriptor to roll out
    pub image: ArtifactRef,
    pub grace_period_secs: u64,
    /// Share of desired tasks that must be healthy before old tasks drain
    pub min_healthy_percent: u32,
}

/// Kind-specific settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionSpec {
    Build(BuildSpec),
    Migrate(MigrationSpec),
    Deploy(DeploySpec),
}

/// A schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub inputs: Vec<ArtifactRef>,
    pub outputs: Vec<OutputSlot>,
    pub env: ExecutionEnv,
    /// Maximum simultaneous executions of this action across runs
    pub concurrency_limit: u32,
    pub spec: ActionSpec,
}

impl Action {
    /// Creates a build action
    pub fn build(
        id: impl Into<String>,
        env: ExecutionEnv,
        inputs: Vec<ArtifactRef>,
        outputs: Vec<OutputSlot>,
        spec: BuildSpec,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            env,
            concurrency_limit: DEFAULT_BUILD_CONCURRENCY,
            spec: ActionSpec::Build(spec),
        }
    }

    /// Creates a migration action; its concurrency limit is always 1
    pub fn migrate(
        id: impl Into<String>,
        env: ExecutionEnv,
        inputs: Vec<ArtifactRef>,
        spec: MigrationSpec,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs: Vec::new(),
            env,
            concurrency_limit: 1,
            spec: ActionSpec::Migrate(spec),
        }
    }

    /// Creates a deploy action consuming `spec.image`
    pub fn deploy(id: impl Into<String>, spec: DeploySpec) -> Self {
        Self {
            id: id.into(),
            inputs: vec![spec.image.clone()],
            outputs: Vec::new(),
            env: ExecutionEnv::default(),
            concurrency_limit: 1,
            spec: ActionSpec::Deploy(spec),
        }
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn kind(&self) -> ActionKind {
        match self.spec {
            ActionSpec::Build(_) => ActionKind::Build,
            ActionSpec::Migrate(_) => ActionKind::Migrate,
            ActionSpec::Deploy(_) => ActionKind::Deploy,
        }
    }

    /// Whether this action writes an image reference
    pub fn produces_image(&self) -> bool {
        self.outputs
            .iter()
            .any(|output| output.kind == ArtifactKind::ImageRef)
    }
}
