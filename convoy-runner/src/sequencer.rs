//! Pipeline sequencer
//!
//! Executes a validated [`Pipeline`]: retrieves the source, then runs stages
//! strictly in ordinal order. Actions of a stage run concurrently, bounded by
//! the configured parallelism. The first action failure (in completion order)
//! fails the stage and becomes the run's cause; no later stage starts, and
//! siblings that have not started yet are skipped. Running siblings are never
//! interrupted.
//!
//! Progress is folded into a [`RunTrail`] and, when an event channel is
//! attached, streamed as [`RunEvent`]s.

use convoy_core::domain::action::Action;
use convoy_core::domain::artifact::{Artifact, ArtifactPayload, ArtifactRef};
use convoy_core::domain::environment::BranchResolution;
use convoy_core::domain::failure::{Failure, FailureKind};
use convoy_core::domain::pipeline::{Pipeline, Stage};
use convoy_core::domain::run::{
    ActionReport, PipelineResult, RunEvent, RunStatus, RunTrail, StepStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionContext, ConcurrencyLimits};
use crate::artifact_store::ArtifactStore;
use crate::config::RunnerConfig;
use crate::context::RunContext;
use crate::lock::MigrationLock;
use crate::podman::ExecutionEnvironment;
use crate::runtime::RuntimeRegistry;
use crate::secrets::SecretStore;
use crate::source::SourceProvider;

/// Checkout directory inside a run workspace
const SOURCE_DIR: &str = "source";

/// Collaborators shared by every run of an engine
#[derive(Clone)]
pub struct Engine {
    pub source: Arc<dyn SourceProvider>,
    pub environment: Arc<dyn ExecutionEnvironment>,
    pub migration_lock: Arc<dyn MigrationLock>,
    pub secrets: Arc<dyn SecretStore>,
    pub runtimes: Arc<RuntimeRegistry>,
    pub limits: Arc<ConcurrencyLimits>,
}

impl Engine {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        environment: Arc<dyn ExecutionEnvironment>,
        migration_lock: Arc<dyn MigrationLock>,
        secrets: Arc<dyn SecretStore>,
        runtimes: Arc<RuntimeRegistry>,
    ) -> Self {
        Self {
            source,
            environment,
            migration_lock,
            secrets,
            runtimes,
            limits: Arc::new(ConcurrencyLimits::new()),
        }
    }
}

enum StageOutcome {
    Succeeded,
    Failed(Failure),
    Cancelled,
}

/// Runs pipelines on an [`Engine`]
pub struct Sequencer {
    engine: Engine,
    config: RunnerConfig,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Sequencer {
    pub fn new(engine: Engine, config: RunnerConfig) -> Self {
        Self {
            engine,
            config,
            event_tx: None,
        }
    }

    /// Streams progress events to `tx` while runs execute
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn emit(&self, event: RunEvent, trail: &mut RunTrail) {
        trail.apply(&event);
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }

    /// Executes `pipeline` to completion
    ///
    /// Never returns early on failure: the result always carries the full
    /// trail, with everything that did not run marked skipped.
    pub async fn run(&self, ctx: &Arc<RunContext>, pipeline: &Pipeline) -> PipelineResult {
        let mut trail = RunTrail::pending(pipeline);

        info!(
            "Run {}: pipeline '{}' on {} (branch {})",
            ctx.run_id,
            pipeline.name(),
            pipeline.environment().name,
            pipeline.branch()
        );
        ctx.log_info(
            None,
            format!(
                "Starting pipeline '{}' for environment '{}' (branch {})",
                pipeline.name(),
                pipeline.environment().name,
                pipeline.branch()
            ),
        );
        if pipeline.environment().resolution == BranchResolution::Fallback {
            warn!(
                "Environment '{}' is not mapped; using branch '{}'",
                pipeline.environment().name,
                pipeline.branch()
            );
            ctx.log_warning(
                None,
                format!(
                    "Environment '{}' is not in the environment table; using branch '{}'",
                    pipeline.environment().name,
                    pipeline.branch()
                ),
            );
        }

        let bundle = match self
            .engine
            .source
            .fetch(
                &pipeline.source().repository,
                pipeline.branch(),
                &ctx.workspace.join(SOURCE_DIR),
            )
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                let failure = Failure::new(FailureKind::SourceUnavailable, format!("{:#}", e));
                return self.finish(ctx, trail, RunStatus::Failed, None, Some(failure));
            }
        };

        let revision = bundle.revision.clone();
        ctx.log_info(None, format!("Checked out revision {}", revision));

        let artifacts = Arc::new(ArtifactStore::new());
        artifacts
            .publish(vec![Artifact::new(
                ArtifactRef::source(),
                SOURCE_DIR,
                ctx.run_id,
                revision.clone(),
                ArtifactPayload::Source(bundle),
            )])
            .await;
        self.emit(
            RunEvent::SourceRetrieved {
                revision: revision.clone(),
            },
            &mut trail,
        )
        .await;

        if let Err(e) = self
            .engine
            .runtimes
            .provision(pipeline, self.engine.secrets.as_ref())
            .await
        {
            let failure = Failure::new(FailureKind::Internal, format!("{:#}", e));
            return self.finish(ctx, trail, RunStatus::Failed, Some(revision), Some(failure));
        }

        let action_ctx = ActionContext {
            run: Arc::clone(ctx),
            engine: self.engine.clone(),
            pipeline: Arc::new(pipeline.clone()),
            artifacts,
            revision: revision.clone(),
            default_image: self.config.default_container_image.clone(),
        };

        for stage in pipeline.stages() {
            if ctx.is_aborted() {
                let failure = Failure::new(
                    FailureKind::Cancelled,
                    format!("run cancelled before stage '{}'", stage.name),
                );
                return self.finish(ctx, trail, RunStatus::Cancelled, Some(revision), Some(failure));
            }

            match self.run_stage(&action_ctx, stage, &mut trail).await {
                StageOutcome::Succeeded => {}
                StageOutcome::Failed(failure) => {
                    return self.finish(ctx, trail, RunStatus::Failed, Some(revision), Some(failure));
                }
                StageOutcome::Cancelled => {
                    let failure = Failure::new(
                        FailureKind::Cancelled,
                        format!("run cancelled during stage '{}'", stage.name),
                    );
                    return self.finish(ctx, trail, RunStatus::Cancelled, Some(revision), Some(failure));
                }
            }
        }

        self.finish(ctx, trail, RunStatus::Succeeded, Some(revision), None)
    }

    async fn run_stage(
        &self,
        actx: &ActionContext,
        stage: &Stage,
        trail: &mut RunTrail,
    ) -> StageOutcome {
        let ordinal = stage.ordinal;
        debug!("Starting stage {} ({})", ordinal, stage.name);
        actx.run
            .log_info(None, format!("Stage '{}' started", stage.name));
        self.emit(RunEvent::StageStarted { ordinal }, trail).await;

        let parallelism = Arc::new(Semaphore::new(self.config.max_parallel_actions.max(1)));
        let stage_failed = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();

        let mut tasks = JoinSet::new();
        let mut task_actions = HashMap::new();
        for action in &stage.actions {
            let handle = tasks.spawn(run_action(
                actx.clone(),
                ordinal,
                action.clone(),
                Arc::clone(&parallelism),
                Arc::clone(&stage_failed),
                tx.clone(),
            ));
            task_actions.insert(handle.id(), (action.id.clone(), action.kind()));
        }
        drop(tx);

        let mut first_failure: Option<Failure> = None;
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if let RunEvent::ActionFinished { report, .. } = &event
                        && let Some(failure) = &report.failure
                    {
                        first_failure.get_or_insert_with(|| failure.clone());
                    }
                    self.emit(event, trail).await;
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        let Some((action_id, kind)) = task_actions.get(&e.id()).cloned() else {
                            continue;
                        };
                        error!("Action {} aborted abnormally: {}", action_id, e);
                        stage_failed.store(true, Ordering::SeqCst);

                        let failure = Failure::new(FailureKind::Internal, format!("action task failed: {}", e))
                            .in_action(&action_id);
                        first_failure.get_or_insert_with(|| failure.clone());

                        let mut report = ActionReport::pending(action_id, kind);
                        report.status = StepStatus::Failed;
                        report.finished_at = Some(chrono::Utc::now());
                        report.failure = Some(failure);
                        self.emit(RunEvent::ActionFinished { ordinal, report }, trail).await;
                    }
                }
                else => break,
            }
        }

        let mut report = match trail.stages.get(ordinal as usize) {
            Some(report) => report.clone(),
            None => return StageOutcome::Failed(Failure::new(
                FailureKind::Internal,
                format!("stage '{}' is missing from the trail", stage.name),
            )),
        };
        let skipped = report
            .actions
            .iter()
            .any(|action| action.status == StepStatus::Skipped);
        report.status = if first_failure.is_some() {
            StepStatus::Failed
        } else if skipped {
            StepStatus::Skipped
        } else {
            StepStatus::Succeeded
        };
        report.finished_at = Some(chrono::Utc::now());

        actx.run.log_info(
            None,
            format!("Stage '{}' finished: {:?}", stage.name, report.status),
        );
        self.emit(RunEvent::StageFinished { report }, trail).await;

        match first_failure {
            Some(failure) => StageOutcome::Failed(failure),
            None if skipped => StageOutcome::Cancelled,
            None => StageOutcome::Succeeded,
        }
    }

    fn finish(
        &self,
        ctx: &RunContext,
        mut trail: RunTrail,
        status: RunStatus,
        revision: Option<String>,
        cause: Option<Failure>,
    ) -> PipelineResult {
        trail.skip_remaining();

        match &cause {
            Some(failure) => {
                warn!("Run {} finished {:?}: {}", ctx.run_id, status, failure);
                ctx.log_error(None, format!("Run {:?}: {}", status, failure));
                if failure.kind.requires_operator() {
                    ctx.log_error(None, "Operator intervention required");
                }
            }
            None => {
                info!("Run {} finished {:?}", ctx.run_id, status);
                ctx.log_info(None, "Run succeeded");
            }
        }

        PipelineResult {
            status,
            revision,
            trail,
            cause,
        }
    }
}

/// Body of one action task
///
/// Actions still waiting for a parallelism slot when a sibling fails, or when
/// the run is cancelled, are reported skipped without starting.
async fn run_action(
    actx: ActionContext,
    ordinal: u32,
    action: Action,
    parallelism: Arc<Semaphore>,
    stage_failed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<RunEvent>,
) {
    let skip = |reason: &str| {
        debug!("Skipping action {}: {}", action.id, reason);
        let mut report = ActionReport::pending(action.id.clone(), action.kind());
        report.status = StepStatus::Skipped;
        events
            .send(RunEvent::ActionFinished { ordinal, report })
            .ok();
    };

    let Ok(_permit) = parallelism.acquire_owned().await else {
        skip("stage closed");
        return;
    };
    if stage_failed.load(Ordering::SeqCst) {
        skip("a sibling action failed");
        return;
    }
    if actx.run.is_aborted() {
        skip("run cancelled");
        return;
    }

    let started_at = chrono::Utc::now();
    events
        .send(RunEvent::ActionStarted {
            ordinal,
            action_id: action.id.clone(),
        })
        .ok();

    let result = actions::execute(&actx, &action).await;

    let mut report = ActionReport::pending(action.id.clone(), action.kind());
    report.started_at = Some(started_at);
    report.finished_at = Some(chrono::Utc::now());
    match result {
        Ok(()) => {
            debug!("Action {} succeeded", action.id);
            report.status = StepStatus::Succeeded;
        }
        Err(e) => {
            stage_failed.store(true, Ordering::SeqCst);
            let failure = e.into_failure(&action.id);
            error!("Action {} failed: {}", action.id, failure);
            actx.run.log_error(Some(&action.id), failure.to_string());
            report.status = StepStatus::Failed;
            report.failure = Some(failure);
        }
    }

    events
        .send(RunEvent::ActionFinished { ordinal, report })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HealthBehavior;
    use crate::secrets::SecretStore;
    use crate::testing::{TestRig, service_pipeline};
    use convoy_core::domain::action::{BuildSpec, ExecutionEnv, SecretRef};
    use convoy_core::domain::artifact::{ArtifactKind, OutputSlot};
    use convoy_core::domain::environment::{Environment, RuntimeParameters};
    use convoy_core::domain::pipeline::SourceSpec;
    use std::time::Duration;

    fn events(rx: &mut mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut collected = Vec::new();
        while let Ok(event) = rx.try_recv() {
            collected.push(event);
        }
        collected
    }

    fn position(events: &[RunEvent], predicate: impl Fn(&RunEvent) -> bool) -> usize {
        events
            .iter()
            .position(predicate)
            .unwrap_or_else(|| panic!("event not found in {:?}", events))
    }

    fn finished(action: &'static str) -> impl Fn(&RunEvent) -> bool {
        move |event| matches!(event, RunEvent::ActionFinished { report, .. } if report.action_id == action)
    }

    #[tokio::test]
    async fn test_successful_run_deploys_revision_image() {
        let rig = TestRig::new();
        let result = rig.run(&service_pipeline("dev", "dev")).await;

        assert_eq!(result.status, RunStatus::Succeeded, "{:?}", result.cause);
        assert_eq!(result.revision.as_deref(), Some("abc123def"));
        assert!(result.cause.is_none());
        assert!(
            result
                .trail
                .stages
                .iter()
                .all(|stage| stage.status == StepStatus::Succeeded)
        );

        let runtime = rig.runtime("svc", "dev").await;
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:abc123def")
        );
        assert_eq!(rig.source.branches(), vec!["dev"]);
    }

    #[tokio::test]
    async fn test_stages_never_overlap() {
        let rig = TestRig::new();
        let (tx, mut rx) = mpsc::channel(1024);
        let sequencer = rig.sequencer().with_event_channel(tx);

        let result = sequencer
            .run(&rig.context(), &service_pipeline("dev", "dev"))
            .await;
        assert!(result.succeeded());

        let events = events(&mut rx);
        let build_done = position(&events, |e| {
            matches!(e, RunEvent::StageFinished { report } if report.ordinal == 0)
        });
        let release_start = position(&events, |e| {
            matches!(e, RunEvent::StageStarted { ordinal: 1 })
        });
        assert!(build_done < release_start);
        assert!(position(&events, finished("image")) < build_done);
        assert!(matches!(events[0], RunEvent::SourceRetrieved { .. }));
    }

    #[tokio::test]
    async fn test_breaker_restores_previous_image() {
        let rig = TestRig::new();
        let pipeline = service_pipeline("dev", "dev");

        assert!(rig.run(&pipeline).await.succeeded());

        rig.source.set_revision("bad0000");
        rig.platform
            .set_behavior("registry/svc:bad0000", HealthBehavior::Never)
            .await;
        let result = rig.run(&pipeline).await;

        assert_eq!(result.status, RunStatus::Failed);
        let cause = result.cause.unwrap();
        assert_eq!(cause.kind, FailureKind::DeployHealthCheckTimeout);
        assert_eq!(cause.action_id.as_deref(), Some("rollout"));

        let runtime = rig.runtime("svc", "dev").await;
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:abc123def")
        );
        assert_eq!(
            rig.platform.running_images().await,
            vec!["registry/svc:abc123def"]
        );
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let rig = TestRig::new();
        let pipeline = service_pipeline("dev", "dev");

        assert!(rig.run(&pipeline).await.succeeded());
        let runtime = rig.runtime("svc", "dev").await;
        let desired = runtime.desired_count();
        let launches = rig.platform.launch_count();

        let rerun = rig.run(&pipeline).await;
        assert!(rerun.succeeded());
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:abc123def")
        );
        assert_eq!(runtime.desired_count(), desired);
        assert_eq!(rig.platform.launch_count(), launches);
    }

    #[tokio::test]
    async fn test_concurrent_migrations_exactly_one_conflicts() {
        let rig = TestRig::new();
        rig.environment
            .delay("migrate up", Duration::from_millis(300));
        let pipeline = service_pipeline("dev", "dev");

        let (first, second) = tokio::join!(rig.run(&pipeline), rig.run(&pipeline));

        let conflicts = [&first, &second]
            .iter()
            .filter(|result| {
                result
                    .cause
                    .as_ref()
                    .is_some_and(|cause| cause.kind == FailureKind::MigrationConflict)
            })
            .count();
        assert_eq!(conflicts, 1);
        assert!(first.succeeded() || second.succeeded());
        assert!(rig.lock.holder("svc-db.dev").is_none());
    }

    #[tokio::test]
    async fn test_environments_migrate_their_own_database() {
        let rig = TestRig::new();
        rig.environment
            .delay("migrate up", Duration::from_millis(300));

        let dev_pipeline = service_pipeline("dev", "dev");
        let prod_pipeline = service_pipeline("prod", "main");
        let (dev, prod) = tokio::join!(rig.run(&dev_pipeline), rig.run(&prod_pipeline));
        assert_eq!(dev.status, RunStatus::Succeeded, "{:?}", dev.cause);
        assert_eq!(prod.status, RunStatus::Succeeded, "{:?}", prod.cause);

        let dev_db = rig
            .secrets
            .resolve(&SecretRef("svc-db-credentials.dev".to_string()))
            .await
            .unwrap();
        let prod_db = rig
            .secrets
            .resolve(&SecretRef("svc-db-credentials.prod".to_string()))
            .await
            .unwrap();
        assert_eq!(dev_db.dbname, "svc_db_dev");
        assert_eq!(prod_db.dbname, "svc_db_prod");
        assert_ne!(dev_db.password, prod_db.password);

        let migrations: Vec<_> = rig
            .environment
            .runs()
            .into_iter()
            .filter(|run| run.commands.iter().any(|c| c == "migrate up"))
            .collect();
        assert_eq!(migrations.len(), 2);
    }

    #[tokio::test]
    async fn test_deploy_may_finish_before_sibling_migration() {
        let rig = TestRig::new();
        rig.environment
            .delay("migrate up", Duration::from_millis(200));
        let (tx, mut rx) = mpsc::channel(1024);
        let sequencer = rig.sequencer().with_event_channel(tx);

        let result = sequencer
            .run(&rig.context(), &service_pipeline("dev", "dev"))
            .await;
        assert!(result.succeeded());

        let events = events(&mut rx);
        assert!(position(&events, finished("rollout")) < position(&events, finished("migrate")));
    }

    #[tokio::test]
    async fn test_build_failure_skips_later_stages() {
        let rig = TestRig::new();
        rig.environment.fail_pushes();

        let result = rig.run(&service_pipeline("dev", "dev")).await;

        assert_eq!(result.status, RunStatus::Failed);
        let cause = result.cause.unwrap();
        assert_eq!(cause.kind, FailureKind::BuildFailure);
        assert_eq!(cause.action_id.as_deref(), Some("image"));

        let release = result.trail.stage("release").unwrap();
        assert_eq!(release.status, StepStatus::Skipped);
        assert!(release.actions.iter().all(|a| a.status == StepStatus::Skipped));
        assert!(rig.environment.runs().iter().all(|run| run.commands != vec!["migrate up"]));
        assert_eq!(rig.runtime("svc", "dev").await.current_image().await, None);
    }

    #[tokio::test]
    async fn test_source_unavailable_runs_nothing() {
        let rig = TestRig::new();
        rig.source.make_unavailable();

        let result = rig.run(&service_pipeline("dev", "dev")).await;

        assert_eq!(result.status, RunStatus::Failed);
        let cause = result.cause.unwrap();
        assert_eq!(cause.kind, FailureKind::SourceUnavailable);
        assert_eq!(cause.action_id, None);
        assert!(result.revision.is_none());
        assert!(
            result
                .trail
                .stages
                .iter()
                .all(|stage| stage.status == StepStatus::Skipped)
        );
        assert!(rig.environment.runs().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_stage() {
        let rig = TestRig::new();
        let ctx = rig.context();
        ctx.abort_signal().raise();

        let result = rig.sequencer().run(&ctx, &service_pipeline("dev", "dev")).await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.cause.unwrap().kind, FailureKind::Cancelled);
        assert!(rig.environment.runs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sibling_prevents_unstarted_actions() {
        let rig = TestRig::with_parallelism(1);
        rig.environment.exit_with("make first", 2);

        let build = |id: &str, command: &str| {
            Action::build(
                id,
                ExecutionEnv {
                    container: None,
                    commands: vec![command.to_string()],
                    env_vars: Default::default(),
                },
                vec![ArtifactRef::source()],
                vec![OutputSlot {
                    slot: id.to_string(),
                    kind: ArtifactKind::Manifest,
                }],
                BuildSpec {
                    image: None,
                    manifest_path: Some("manifest.json".to_string()),
                },
            )
        };
        let pipeline = Pipeline::new(
            "checks",
            "svc",
            SourceSpec {
                repository: "https://git.example.com/svc.git".to_string(),
            },
            Environment {
                name: "dev".to_string(),
                branch: "dev".to_string(),
                runtime: RuntimeParameters::default(),
                resolution: BranchResolution::Mapped,
            },
            vec![Stage::new(
                "checks",
                0,
                vec![build("first", "make first"), build("second", "make second")],
            )],
        )
        .unwrap();

        let result = rig.run(&pipeline).await;

        assert_eq!(result.status, RunStatus::Failed);
        let stage = result.trail.stage("checks").unwrap();
        assert_eq!(stage.status, StepStatus::Failed);
        assert_eq!(stage.action("first").unwrap().status, StepStatus::Failed);
        assert_eq!(stage.action("second").unwrap().status, StepStatus::Skipped);
        assert_eq!(rig.environment.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_environment_uses_its_name_as_branch() {
        let rig = TestRig::new();
        let mut pipeline = service_pipeline("feature-x", "feature-x");
        pipeline = Pipeline::new(
            pipeline.name(),
            pipeline.service(),
            pipeline.source().clone(),
            Environment {
                resolution: BranchResolution::Fallback,
                ..pipeline.environment().clone()
            },
            pipeline.stages().to_vec(),
        )
        .unwrap();

        let ctx = rig.context();
        let result = rig.sequencer().run(&ctx, &pipeline).await;

        assert!(result.succeeded());
        assert_eq!(rig.source.branches(), vec!["feature-x"]);
        assert!(
            ctx.drain_logs()
                .iter()
                .any(|entry| entry.message.contains("not in the environment table"))
        );
    }
}
