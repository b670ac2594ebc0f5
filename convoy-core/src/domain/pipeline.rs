//! Pipeline topology
//!
//! A [`PipelineDefinition`] is the declarative, environment-independent list of
//! stages and actions. Binding it to an environment yields a [`Pipeline`], which
//! is what the runner executes. Both are validated on construction so that
//! ordering invariants never have to be checked while a run is in flight.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::domain::action::{Action, ActionKind, ActionSpec};
use crate::domain::artifact::{ArtifactKind, ArtifactRef, SOURCE_STAGE};
use crate::domain::environment::{Environment, EnvironmentError, EnvironmentTable};

/// Topology validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    #[error("field '{0}' cannot be empty")]
    EmptyField(&'static str),

    #[error("source repository '{0}' cannot start with '-'")]
    InvalidRepository(String),

    #[error("pipeline must have at least one stage")]
    NoStages,

    #[error("stage '{0}' has no actions")]
    EmptyStage(String),

    #[error("stage '{stage}' has ordinal {found}, expected {expected}")]
    NonContiguousOrdinal {
        stage: String,
        expected: u32,
        found: u32,
    },

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage name '{0}' is reserved")]
    ReservedStageName(String),

    #[error("duplicate action id '{0}'")]
    DuplicateAction(String),

    #[error("stage '{stage}' declares output slot '{slot}' more than once")]
    DuplicateOutput { stage: String, slot: String },

    #[error("action '{action}' consumes '{reference}', which no action produces")]
    UnknownArtifact { action: String, reference: String },

    #[error(
        "action '{action}' consumes '{reference}', which is not produced by a strictly earlier stage"
    )]
    ForwardReference { action: String, reference: String },

    #[error("action '{action}' expects '{reference}' to be {expected}, but it is {found}")]
    KindMismatch {
        action: String,
        reference: String,
        expected: ArtifactKind,
        found: ArtifactKind,
    },

    #[error("action '{action}' cannot declare output '{slot}' of kind {kind}")]
    InvalidOutputKind {
        action: String,
        slot: String,
        kind: ArtifactKind,
    },

    #[error("action '{action}' declares output '{slot}' but has no '{setting}' setting")]
    MissingBuildSetting {
        action: String,
        slot: String,
        setting: &'static str,
    },

    #[error("deploy action '{0}' must list its image artifact among its inputs")]
    DeployInputMissing(String),

    #[error("action '{action}' has invalid concurrency limit {limit}")]
    InvalidConcurrency { action: String, limit: u32 },

    #[error("migration '{action}' in stage '{stage}' is scheduled before the image build")]
    MigrationBeforeBuild { action: String, stage: String },

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// Ordered group of concurrently running actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub ordinal: u32,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>, ordinal: u32, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            ordinal,
            actions,
        }
    }
}

/// Where source is retrieved from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub repository: String,
}

impl SourceSpec {
    /// Rejects repositories git would read as an option
    pub fn validate(&self) -> Result<(), TopologyError> {
        let repository = self.repository.trim();
        if repository.is_empty() {
            return Err(TopologyError::EmptyField("source.repository"));
        }
        if repository.starts_with('-') {
            return Err(TopologyError::InvalidRepository(self.repository.clone()));
        }
        Ok(())
    }
}

/// Environment-independent pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Service the deploy actions roll out to
    pub service: String,
    pub source: SourceSpec,
    pub environments: EnvironmentTable,
    pub stages: Vec<Stage>,
}

impl PipelineDefinition {
    /// Validates the stage/action topology
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.name.trim().is_empty() {
            return Err(TopologyError::EmptyField("name"));
        }
        if self.service.trim().is_empty() {
            return Err(TopologyError::EmptyField("service"));
        }
        self.source.validate()?;
        validate_stages(&self.stages)
    }

    /// Binds the definition to an environment
    ///
    /// The branch is chosen here, once, and cannot change for the lifetime of
    /// the returned pipeline.
    pub fn instantiate(&self, environment: &str) -> Result<Pipeline, TopologyError> {
        self.validate()?;
        let environment = self.environments.resolve(environment)?;

        Ok(Pipeline {
            name: self.name.clone(),
            service: self.service.clone(),
            source: self.source.clone(),
            environment,
            stages: self.stages.clone(),
        })
    }
}

/// A validated pipeline bound to one environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pipeline {
    name: String,
    service: String,
    source: SourceSpec,
    environment: Environment,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Builds a pipeline directly from its parts, validating the topology
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        source: SourceSpec,
        environment: Environment,
        stages: Vec<Stage>,
    ) -> Result<Self, TopologyError> {
        let name = name.into();
        let service = service.into();

        if name.trim().is_empty() {
            return Err(TopologyError::EmptyField("name"));
        }
        if service.trim().is_empty() {
            return Err(TopologyError::EmptyField("service"));
        }
        if environment.branch.trim().is_empty() {
            return Err(EnvironmentError::EmptyBranch(environment.name.clone()).into());
        }
        source.validate()?;
        validate_stages(&stages)?;

        Ok(Self {
            name,
            service,
            source,
            environment,
            stages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn branch(&self) -> &str {
        &self.environment.branch
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.actions.len()).sum()
    }
}

/// Pipeline definition registered with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPipeline {
    pub id: uuid::Uuid,
    pub name: String,
    pub service: String,
    pub description: Option<String>,
    /// Definition script as submitted
    pub script: String,
    pub definition: PipelineDefinition,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Validation
// =============================================================================

fn validate_stages(stages: &[Stage]) -> Result<(), TopologyError> {
    if stages.is_empty() {
        return Err(TopologyError::NoStages);
    }

    // Everything any stage declares, so references can be told apart as
    // "forward" versus "unknown"
    let mut declared: HashMap<ArtifactRef, (u32, ArtifactKind)> = HashMap::new();
    let mut stage_names = HashSet::new();
    let mut action_ids = HashSet::new();

    for (index, stage) in stages.iter().enumerate() {
        let expected = index as u32;
        if stage.ordinal != expected {
            return Err(TopologyError::NonContiguousOrdinal {
                stage: stage.name.clone(),
                expected,
                found: stage.ordinal,
            });
        }
        if stage.name.trim().is_empty() {
            return Err(TopologyError::EmptyField("stage.name"));
        }
        if stage.name == SOURCE_STAGE {
            return Err(TopologyError::ReservedStageName(stage.name.clone()));
        }
        if !stage_names.insert(stage.name.as_str()) {
            return Err(TopologyError::DuplicateStage(stage.name.clone()));
        }
        if stage.actions.is_empty() {
            return Err(TopologyError::EmptyStage(stage.name.clone()));
        }

        for action in &stage.actions {
            if action.id.trim().is_empty() {
                return Err(TopologyError::EmptyField("action.id"));
            }
            if !action_ids.insert(action.id.as_str()) {
                return Err(TopologyError::DuplicateAction(action.id.clone()));
            }
            validate_outputs(action)?;

            for output in &action.outputs {
                let reference = ArtifactRef::new(stage.name.clone(), output.slot.clone());
                if declared
                    .insert(reference, (stage.ordinal, output.kind))
                    .is_some()
                {
                    return Err(TopologyError::DuplicateOutput {
                        stage: stage.name.clone(),
                        slot: output.slot.clone(),
                    });
                }
            }
        }
    }

    let first_image_build = stages
        .iter()
        .find(|stage| stage.actions.iter().any(Action::produces_image))
        .map(|stage| stage.ordinal);

    for stage in stages {
        for action in &stage.actions {
            validate_concurrency(action)?;

            for reference in &action.inputs {
                let kind = resolve_input(&declared, stage.ordinal, action, reference)?;
                if let ActionSpec::Deploy(spec) = &action.spec
                    && spec.image == *reference
                    && kind != ArtifactKind::ImageRef
                {
                    return Err(TopologyError::KindMismatch {
                        action: action.id.clone(),
                        reference: reference.to_string(),
                        expected: ArtifactKind::ImageRef,
                        found: kind,
                    });
                }
            }

            match &action.spec {
                ActionSpec::Deploy(spec) if !action.inputs.contains(&spec.image) => {
                    return Err(TopologyError::DeployInputMissing(action.id.clone()));
                }
                ActionSpec::Migrate(_) => {
                    if let Some(build_ordinal) = first_image_build
                        && stage.ordinal < build_ordinal
                    {
                        return Err(TopologyError::MigrationBeforeBuild {
                            action: action.id.clone(),
                            stage: stage.name.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn resolve_input(
    declared: &HashMap<ArtifactRef, (u32, ArtifactKind)>,
    consumer_ordinal: u32,
    action: &Action,
    reference: &ArtifactRef,
) -> Result<ArtifactKind, TopologyError> {
    if reference.is_source() {
        if *reference != ArtifactRef::source() {
            return Err(TopologyError::UnknownArtifact {
                action: action.id.clone(),
                reference: reference.to_string(),
            });
        }
        return Ok(ArtifactKind::Source);
    }

    match declared.get(reference) {
        None => Err(TopologyError::UnknownArtifact {
            action: action.id.clone(),
            reference: reference.to_string(),
        }),
        Some((producer_ordinal, _)) if *producer_ordinal >= consumer_ordinal => {
            Err(TopologyError::ForwardReference {
                action: action.id.clone(),
                reference: reference.to_string(),
            })
        }
        Some((_, kind)) => Ok(*kind),
    }
}

fn validate_outputs(action: &Action) -> Result<(), TopologyError> {
    let ActionSpec::Build(spec) = &action.spec else {
        // Only builds emit artifacts; migrations and deploys mutate external state
        if let Some(output) = action.outputs.first() {
            return Err(TopologyError::InvalidOutputKind {
                action: action.id.clone(),
                slot: output.slot.clone(),
                kind: output.kind,
            });
        }
        return Ok(());
    };

    for output in &action.outputs {
        match output.kind {
            ArtifactKind::Source => {
                return Err(TopologyError::InvalidOutputKind {
                    action: action.id.clone(),
                    slot: output.slot.clone(),
                    kind: output.kind,
                });
            }
            ArtifactKind::ImageRef if spec.image.is_none() => {
                return Err(TopologyError::MissingBuildSetting {
                    action: action.id.clone(),
                    slot: output.slot.clone(),
                    setting: "image",
                });
            }
            ArtifactKind::Manifest if spec.manifest_path.is_none() => {
                return Err(TopologyError::MissingBuildSetting {
                    action: action.id.clone(),
                    slot: output.slot.clone(),
                    setting: "manifest",
                });
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_concurrency(action: &Action) -> Result<(), TopologyError> {
    let valid = match action.kind() {
        ActionKind::Migrate => action.concurrency_limit == 1,
        ActionKind::Build | ActionKind::Deploy => action.concurrency_limit >= 1,
    };

    if valid {
        Ok(())
    } else {
        Err(TopologyError::InvalidConcurrency {
            action: action.id.clone(),
            limit: action.concurrency_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::{
        BuildSpec, DeploySpec, ExecutionEnv, ImageBuild, MigrationSpec, SecretRef,
    };
    use crate::domain::artifact::OutputSlot;
    use crate::domain::environment::{BranchResolution, RuntimeParameters};

    fn build_action() -> Action {
        Action::build(
            "image",
            ExecutionEnv::default(),
            vec![ArtifactRef::source()],
            vec![OutputSlot {
                slot: "image".to_string(),
                kind: ArtifactKind::ImageRef,
            }],
            BuildSpec {
                image: Some(ImageBuild {
                    repository: "registry/svc".to_string(),
                    dockerfile: "Dockerfile".to_string(),
                    context: ".".to_string(),
                    push: true,
                }),
                manifest_path: None,
            },
        )
    }

    fn migrate_action() -> Action {
        Action::migrate(
            "migrate",
            ExecutionEnv::default(),
            vec![ArtifactRef::source()],
            MigrationSpec {
                database: "svc-db".to_string(),
                secret: SecretRef("svc-db".to_string()),
            },
        )
    }

    fn deploy_action(image: ArtifactRef) -> Action {
        Action::deploy(
            "rollout",
            DeploySpec {
                image,
                grace_period_secs: 60,
                min_healthy_percent: 100,
            },
        )
    }

    fn dev() -> Environment {
        Environment {
            name: "dev".to_string(),
            branch: "dev".to_string(),
            runtime: RuntimeParameters::default(),
            resolution: BranchResolution::Mapped,
        }
    }

    fn source() -> SourceSpec {
        SourceSpec {
            repository: "https://git.example.com/svc.git".to_string(),
        }
    }

    fn pipeline(stages: Vec<Stage>) -> Result<Pipeline, TopologyError> {
        Pipeline::new("svc-deploy", "svc", source(), dev(), stages)
    }

    #[test]
    fn test_valid_pipeline() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new(
                "deploy",
                1,
                vec![migrate_action(), deploy_action(ArtifactRef::new("build", "image"))],
            ),
        ]);

        let pipeline = result.unwrap();
        assert_eq!(pipeline.branch(), "dev");
        assert_eq!(pipeline.action_count(), 3);
    }

    #[test]
    fn test_no_stages_rejected() {
        assert_eq!(pipeline(vec![]), Err(TopologyError::NoStages));
    }

    #[test]
    fn test_non_contiguous_ordinals_rejected() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new(
                "deploy",
                2,
                vec![deploy_action(ArtifactRef::new("build", "image"))],
            ),
        ]);

        assert!(matches!(
            result,
            Err(TopologyError::NonContiguousOrdinal {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_same_stage_reference_rejected() {
        let result = pipeline(vec![Stage::new(
            "build",
            0,
            vec![build_action(), deploy_action(ArtifactRef::new("build", "image"))],
        )]);

        assert!(matches!(
            result,
            Err(TopologyError::ForwardReference { .. })
        ));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let result = pipeline(vec![
            Stage::new(
                "deploy",
                0,
                vec![deploy_action(ArtifactRef::new("build", "image"))],
            ),
            Stage::new("build", 1, vec![build_action()]),
        ]);

        assert!(matches!(
            result,
            Err(TopologyError::ForwardReference { .. })
        ));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new(
                "deploy",
                1,
                vec![deploy_action(ArtifactRef::new("build", "missing"))],
            ),
        ]);

        assert!(matches!(result, Err(TopologyError::UnknownArtifact { .. })));
    }

    #[test]
    fn test_deploy_of_non_image_rejected() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new("deploy", 1, vec![deploy_action(ArtifactRef::source())]),
        ]);

        assert!(matches!(
            result,
            Err(TopologyError::KindMismatch {
                expected: ArtifactKind::ImageRef,
                found: ArtifactKind::Source,
                ..
            })
        ));
    }

    #[test]
    fn test_migration_before_build_rejected() {
        let result = pipeline(vec![
            Stage::new("migrate", 0, vec![migrate_action()]),
            Stage::new("build", 1, vec![build_action()]),
            Stage::new(
                "deploy",
                2,
                vec![deploy_action(ArtifactRef::new("build", "image"))],
            ),
        ]);

        assert!(matches!(
            result,
            Err(TopologyError::MigrationBeforeBuild { .. })
        ));
    }

    #[test]
    fn test_migration_alongside_build_allowed() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action(), migrate_action()]),
            Stage::new(
                "deploy",
                1,
                vec![deploy_action(ArtifactRef::new("build", "image"))],
            ),
        ]);

        assert!(result.is_ok());
    }

    #[test]
    fn test_migration_concurrency_must_be_one() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new(
                "deploy",
                1,
                vec![migrate_action().with_concurrency_limit(2)],
            ),
        ]);

        assert!(matches!(
            result,
            Err(TopologyError::InvalidConcurrency { limit: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let result = pipeline(vec![
            Stage::new("build", 0, vec![build_action()]),
            Stage::new("again", 1, vec![build_action()]),
        ]);

        assert_eq!(
            result,
            Err(TopologyError::DuplicateAction("image".to_string()))
        );
    }

    #[test]
    fn test_reserved_stage_name_rejected() {
        let result = pipeline(vec![Stage::new("source", 0, vec![build_action()])]);
        assert!(matches!(result, Err(TopologyError::ReservedStageName(_))));
    }

    #[test]
    fn test_image_output_requires_image_setting() {
        let mut action = build_action();
        action.spec = ActionSpec::Build(BuildSpec::default());

        let result = pipeline(vec![Stage::new("build", 0, vec![action])]);
        assert!(matches!(
            result,
            Err(TopologyError::MissingBuildSetting {
                setting: "image",
                ..
            })
        ));
    }

    #[test]
    fn test_option_like_repository_rejected() {
        let result = Pipeline::new(
            "svc-deploy",
            "svc",
            SourceSpec {
                repository: "--upload-pack=touch /tmp/x".to_string(),
            },
            dev(),
            vec![Stage::new("build", 0, vec![build_action()])],
        );
        assert!(matches!(result, Err(TopologyError::InvalidRepository(_))));
    }

    #[test]
    fn test_instantiate_resolves_branch_once() {
        let definition = PipelineDefinition {
            name: "svc-deploy".to_string(),
            description: None,
            service: "svc".to_string(),
            source: source(),
            environments: EnvironmentTable::default(),
            stages: vec![
                Stage::new("build", 0, vec![build_action()]),
                Stage::new(
                    "deploy",
                    1,
                    vec![deploy_action(ArtifactRef::new("build", "image"))],
                ),
            ],
        };

        let pipeline = definition.instantiate("test").unwrap();
        assert_eq!(pipeline.branch(), "test");
        assert_eq!(pipeline.environment().resolution, BranchResolution::Fallback);
    }
}
