//! In-memory fakes for the engine's trait seams

use anyhow::Result;
use async_trait::async_trait;
use convoy_core::domain::action::{
    Action, BuildSpec, DeploySpec, ExecutionEnv, ImageBuild, MigrationSpec, SecretRef,
};
use convoy_core::domain::artifact::{ArtifactKind, ArtifactRef, OutputSlot, SourceBundle};
use convoy_core::domain::environment::{BranchResolution, Environment, RuntimeParameters};
use convoy_core::domain::pipeline::{Pipeline, SourceSpec, Stage};
use convoy_core::domain::run::PipelineResult;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::actions::ActionContext;
use crate::artifact_store::ArtifactStore;
use crate::config::RunnerConfig;
use crate::context::RunContext;
use crate::lock::InMemoryMigrationLock;
use crate::podman::{CommandOutput, CommandSpec, ExecutionEnvironment};
use crate::runtime::{LocalProvisioner, RuntimeRegistry, ServiceRuntimeHandle, SimulatedPlatform};
use crate::secrets::{DatabaseCredentials, InMemorySecretStore};
use crate::sequencer::{Engine, Sequencer};
use crate::source::SourceProvider;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Source provider that "checks out" a fixed revision into an empty directory
pub struct StaticSource {
    revision: Mutex<String>,
    available: AtomicBool,
    branches: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn new(revision: &str) -> Self {
        Self {
            revision: Mutex::new(revision.to_string()),
            available: AtomicBool::new(true),
            branches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_revision(&self, revision: &str) {
        *lock(&self.revision) = revision.to_string();
    }

    pub fn make_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    /// Branches fetched so far, in order
    pub fn branches(&self) -> Vec<String> {
        lock(&self.branches).clone()
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn fetch(
        &self,
        repository: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<SourceBundle> {
        lock(&self.branches).push(branch.to_string());
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("remote branch '{}' not found in {}", branch, repository);
        }

        tokio::fs::create_dir_all(destination).await?;
        Ok(SourceBundle {
            repository: repository.to_string(),
            branch: branch.to_string(),
            revision: lock(&self.revision).clone(),
            path: destination.display().to_string(),
        })
    }
}

/// Execution environment that records commands instead of running them
///
/// Behavior is keyed by command text: exit codes, delays, and files the
/// command "writes" into its working directory.
#[derive(Default)]
pub struct ScriptedEnvironment {
    runs: Mutex<Vec<CommandSpec>>,
    exit_codes: Mutex<HashMap<String, i32>>,
    delays: Mutex<HashMap<String, Duration>>,
    writes: Mutex<HashMap<String, (String, String)>>,
    built: Mutex<Vec<String>>,
    pushed: Mutex<Vec<String>>,
    fail_push: AtomicBool,
}

impl ScriptedEnvironment {
    pub fn exit_with(&self, command: &str, code: i32) {
        lock(&self.exit_codes).insert(command.to_string(), code);
    }

    pub fn delay(&self, command: &str, delay: Duration) {
        lock(&self.delays).insert(command.to_string(), delay);
    }

    pub fn write_on(&self, command: &str, path: &str, content: &str) {
        lock(&self.writes).insert(command.to_string(), (path.to_string(), content.to_string()));
    }

    pub fn fail_pushes(&self) {
        self.fail_push.store(true, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<CommandSpec> {
        lock(&self.runs).clone()
    }

    pub fn built(&self) -> Vec<String> {
        lock(&self.built).clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        lock(&self.pushed).clone()
    }
}

#[async_trait]
impl ExecutionEnvironment for ScriptedEnvironment {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        lock(&self.runs).push(spec.clone());

        let delay = {
            let delays = lock(&self.delays);
            spec.commands
                .iter()
                .filter_map(|command| delays.get(command).copied())
                .max()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        for command in &spec.commands {
            let code = lock(&self.exit_codes).get(command).copied();
            if let Some(code) = code {
                return Ok(CommandOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: format!("{}: scripted failure", command),
                });
            }

            let write = lock(&self.writes).get(command).cloned();
            if let Some((path, content)) = write {
                let target = spec.workdir.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(target, content).await?;
            }
        }

        Ok(CommandOutput {
            exit_code: 0,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
        })
    }

    async fn build_image(&self, _context: &Path, _dockerfile: &str, tag: &str) -> Result<()> {
        lock(&self.built).push(tag.to_string());
        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            anyhow::bail!("registry rejected {}", tag);
        }
        lock(&self.pushed).push(tag.to_string());
        Ok(())
    }
}

/// Build -> (migrate | deploy) pipeline of service `svc`
pub fn service_pipeline(environment: &str, branch: &str) -> Pipeline {
    let build = Action::build(
        "image",
        ExecutionEnv {
            container: Some("docker.io/rust:1".to_string()),
            commands: vec!["cargo build --release".to_string()],
            env_vars: Default::default(),
        },
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
    );
    let migrate = Action::migrate(
        "migrate",
        ExecutionEnv {
            container: Some("docker.io/migrate/migrate".to_string()),
            commands: vec!["migrate up".to_string()],
            env_vars: Default::default(),
        },
        vec![ArtifactRef::source()],
        MigrationSpec {
            database: "svc-db".to_string(),
            secret: SecretRef("svc-db-credentials".to_string()),
        },
    );
    let deploy = Action::deploy(
        "rollout",
        DeploySpec {
            image: ArtifactRef::new("build", "image"),
            grace_period_secs: 1,
            min_healthy_percent: 100,
        },
    );

    Pipeline::new(
        "svc-pipeline",
        "svc",
        SourceSpec {
            repository: "https://git.example.com/svc.git".to_string(),
        },
        Environment {
            name: environment.to_string(),
            branch: branch.to_string(),
            runtime: RuntimeParameters::default(),
            resolution: BranchResolution::Mapped,
        },
        vec![
            Stage::new("build", 0, vec![build]),
            Stage::new("release", 1, vec![migrate, deploy]),
        ],
    )
    .expect("fixture pipeline is valid")
}

/// A fully faked engine
pub struct TestRig {
    pub source: Arc<StaticSource>,
    pub environment: Arc<ScriptedEnvironment>,
    pub platform: Arc<SimulatedPlatform>,
    pub lock: InMemoryMigrationLock,
    pub secrets: Arc<InMemorySecretStore>,
    pub engine: Engine,
    pub config: RunnerConfig,
    workspace: tempfile::TempDir,
}

impl TestRig {
    pub const DB_PASSWORD: &'static str = "s3cr3t-test-password";

    pub fn new() -> Self {
        Self::with_parallelism(4)
    }

    pub fn with_parallelism(max_parallel_actions: usize) -> Self {
        let workspace = tempfile::tempdir().expect("temp workspace");

        let mut config = RunnerConfig::new(workspace.path().to_path_buf());
        config.max_parallel_actions = max_parallel_actions;
        config.health_poll_interval = Duration::from_millis(5);
        config.rollback_max_attempts = 3;
        config.rollback_backoff = Duration::from_millis(1);

        let source = Arc::new(StaticSource::new("abc123def"));
        let environment = Arc::new(ScriptedEnvironment::default());
        let platform = Arc::new(SimulatedPlatform::new());
        let lock = InMemoryMigrationLock::new();
        let secrets = Arc::new(InMemorySecretStore::new());

        let provisioner = LocalProvisioner::new(
            platform.clone(),
            config.runtime_settings(),
            config.autoscaling_settings(),
            Arc::clone(&secrets),
        );
        let engine = Engine::new(
            source.clone(),
            environment.clone(),
            Arc::new(lock.clone()),
            secrets.clone(),
            Arc::new(RuntimeRegistry::new(Arc::new(provisioner))),
        );

        Self {
            source,
            environment,
            platform,
            lock,
            secrets,
            engine,
            config,
            workspace,
        }
    }

    pub fn context(&self) -> Arc<RunContext> {
        RunContext::standalone(Uuid::new_v4(), self.workspace.path().to_path_buf())
    }

    pub fn sequencer(&self) -> Sequencer {
        Sequencer::new(self.engine.clone(), self.config.clone())
    }

    pub async fn run(&self, pipeline: &Pipeline) -> PipelineResult {
        self.sequencer().run(&self.context(), pipeline).await
    }

    pub async fn runtime(&self, service: &str, environment: &str) -> ServiceRuntimeHandle {
        self.engine
            .runtimes
            .get(service, environment)
            .await
            .expect("runtime was provisioned")
    }

    /// Context for calling an action directly, with an empty artifact store
    pub fn action_context(&self, pipeline: Pipeline, revision: &str) -> ActionContext {
        ActionContext {
            run: self.context(),
            engine: self.engine.clone(),
            pipeline: Arc::new(pipeline),
            artifacts: Arc::new(ArtifactStore::new()),
            revision: revision.to_string(),
            default_image: self.config.default_container_image.clone(),
        }
    }

    pub async fn insert_database_secret(&self, name: &str) {
        self.secrets
            .insert(
                SecretRef(name.to_string()),
                DatabaseCredentials {
                    host: "db.internal".to_string(),
                    port: 5432,
                    username: "svc".to_string(),
                    password: Self::DB_PASSWORD.to_string(),
                    dbname: "svc".to_string(),
                },
            )
            .await;
    }
}
