//! Run scheduler
//!
//! Polls the database for queued runs and executes them on the engine.
//! Each run executes in its own task with its own context (workspace, log
//! buffer, abort signal). Trail changes are persisted as they happen and
//! logs are flushed periodically.

use anyhow::{Context as AnyhowContext, Result};
use convoy_core::domain::failure::{Failure, FailureKind};
use convoy_core::domain::run::{PipelineRun, RunEvent, RunTrail};
use convoy_runner::{AbortSignal, Engine, InMemoryLogBuffer, RunContext, Sequencer};
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::repository::{pipeline_repository, run_repository};
use crate::service::{log_service, run_service};

/// Abort signals of the runs executing in this process
///
/// A run's signal exists from before it is claimed until it finishes, so a
/// cancel that arrives at any point after the claim reaches it.
#[derive(Default)]
pub struct RunCancellations {
    signals: Mutex<HashMap<Uuid, AbortSignal>>,
}

impl RunCancellations {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: Uuid) -> AbortSignal {
        let signal = AbortSignal::new();
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, signal.clone());
        signal
    }

    fn remove(&self, run_id: Uuid) {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
    }

    /// Registers a signal for `run_id`, then runs `claim`
    ///
    /// Returns the signal when the claim succeeded. Otherwise the signal is
    /// removed again and `None` or the claim's error is returned.
    async fn claim<F, E>(&self, run_id: Uuid, claim: F) -> Result<Option<AbortSignal>, E>
    where
        F: Future<Output = Result<bool, E>>,
    {
        let signal = self.register(run_id);
        match claim.await {
            Ok(true) => Ok(Some(signal)),
            Ok(false) => {
                self.remove(run_id);
                Ok(None)
            }
            Err(e) => {
                self.remove(run_id);
                Err(e)
            }
        }
    }

    /// Raises the abort signal of a run; false if the run is not executing here
    pub fn raise(&self, run_id: Uuid) -> bool {
        match self
            .signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
        {
            Some(signal) => {
                signal.raise();
                true
            }
            None => false,
        }
    }
}

/// Scheduler that continuously claims and executes queued runs
pub struct RunScheduler {
    config: OrchestratorConfig,
    pool: PgPool,
    engine: Engine,
    cancellations: Arc<RunCancellations>,
    semaphore: Arc<Semaphore>,
}

impl RunScheduler {
    pub fn new(
        config: OrchestratorConfig,
        pool: PgPool,
        engine: Engine,
        cancellations: Arc<RunCancellations>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_runs));
        Self {
            config,
            pool,
            engine,
            cancellations,
            semaphore,
        }
    }

    /// Starts the polling loop
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting run scheduler (interval: {:?}, max parallel runs: {})",
            self.config.poll_interval, self.config.max_parallel_runs
        );

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} run(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Performs a single poll cycle
    async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let free = self.semaphore.available_permits();
        if free == 0 {
            debug!("Max parallel runs reached; not polling");
            return Ok(0);
        }

        let runs = run_repository::find_queued(&self.pool, free as i64)
            .await
            .context("Failed to fetch queued runs")?;

        if runs.is_empty() {
            debug!("No queued runs");
            return Ok(0);
        }

        let mut started = 0;
        for run in runs {
            // Try to acquire semaphore permit, skip if at max capacity
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                debug!("Max parallel runs reached, leaving run {} queued", run.id);
                break;
            };

            let claim = run_repository::claim(&self.pool, run.id);
            let Some(signal) = self.cancellations.claim(run.id, claim).await? else {
                debug!("Run {} was claimed or cancelled elsewhere", run.id);
                continue;
            };

            self.spawn_run_task(run, signal, permit);
            started += 1;
        }

        Ok(started)
    }

    /// Spawns a task to execute a single claimed run
    fn spawn_run_task(
        self: &Arc<Self>,
        run: PipelineRun,
        signal: AbortSignal,
        permit: OwnedSemaphorePermit,
    ) {
        let scheduler = Arc::clone(self);

        tokio::spawn(async move {
            let run_id = run.id;
            if let Err(e) = scheduler.execute_run(run, signal).await {
                error!("Failed to execute run {}: {:#}", run_id, e);
                let cause = Failure::new(FailureKind::Internal, format!("{:#}", e));
                if let Err(e) = run_repository::fail(&scheduler.pool, run_id, &cause).await {
                    error!("Failed to record failure of run {}: {}", run_id, e);
                }
            }
            scheduler.cancellations.remove(run_id);
            drop(permit);
        });
    }

    /// Executes a single run with trail persistence and log flushing
    async fn execute_run(&self, run: PipelineRun, signal: AbortSignal) -> Result<()> {
        info!("Starting execution of run {}", run.id);

        let registered = pipeline_repository::find_by_id(&self.pool, run.pipeline_id)
            .await?
            .with_context(|| format!("Pipeline {} no longer exists", run.pipeline_id))?;
        let pipeline = run_service::bind_pipeline(&registered.definition, &run)
            .context("Pipeline no longer binds to the run's environment")?;

        let context = RunContext::new(
            run.id,
            self.config.runner.workspace_base.clone(),
            Arc::new(InMemoryLogBuffer::new()),
            signal,
        );

        let (tx, rx) = mpsc::channel(256);
        let trail_writer = Self::spawn_trail_writer(
            run.id,
            self.pool.clone(),
            RunTrail::pending(&pipeline),
            rx,
        );
        let log_flusher = Self::spawn_log_flusher(
            run.id,
            Arc::clone(&context),
            self.pool.clone(),
            self.config.log_flush_interval,
        );

        let sequencer =
            Sequencer::new(self.engine.clone(), self.config.runner.clone()).with_event_channel(tx);
        let result = sequencer.run(&context, &pipeline).await;

        // Closing the channel lets the writer drain and exit
        drop(sequencer);
        if let Err(e) = trail_writer.await {
            warn!("Trail writer of run {} panicked: {}", run.id, e);
        }

        // Always abort log flusher
        log_flusher.abort();

        // Send remaining logs
        let remaining_logs = context.drain_logs();
        if !remaining_logs.is_empty() {
            debug!(
                "Flushing {} remaining logs for run {}",
                remaining_logs.len(),
                run.id
            );
            if let Err(e) = log_service::add_log_entries(&self.pool, run.id, remaining_logs).await
            {
                warn!("Failed to store final logs of run {}: {:?}", run.id, e);
            }
        }

        run_repository::complete(&self.pool, run.id, &result)
            .await
            .context("Failed to record run result")?;

        if let Err(e) = tokio::fs::remove_dir_all(&context.workspace).await {
            debug!("Workspace of run {} not removed: {}", run.id, e);
        }

        info!("Run {} finished with status {:?}", run.id, result.status);
        Ok(())
    }

    /// Spawns a task folding run events into the stored trail
    fn spawn_trail_writer(
        run_id: Uuid,
        pool: PgPool,
        mut trail: RunTrail,
        mut events: mpsc::Receiver<RunEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let revision = match &event {
                    RunEvent::SourceRetrieved { revision } => Some(revision.clone()),
                    _ => None,
                };
                trail.apply(&event);

                if let Err(e) =
                    run_repository::update_trail(&pool, run_id, &trail, revision.as_deref()).await
                {
                    warn!("Failed to persist trail of run {}: {}", run_id, e);
                }
            }
        })
    }

    /// Spawns a background task to store logs periodically
    fn spawn_log_flusher(
        run_id: Uuid,
        context: Arc<RunContext>,
        pool: PgPool,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                ticker.tick().await;

                let logs = context.drain_logs();

                if logs.is_empty() {
                    continue;
                }

                debug!("Storing {} logs for run {}", logs.len(), run_id);

                if let Err(e) = log_service::add_log_entries(&pool, run_id, logs).await {
                    error!("Failed to store logs for run {}: {:?}", run_id, e);
                }
            }
        })
    }
}
