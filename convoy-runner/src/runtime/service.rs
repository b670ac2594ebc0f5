//! Service runtime
//!
//! Holds the task set of one service in one environment and keeps it converged
//! on the current image and desired count.

use anyhow::Result;
use convoy_core::domain::environment::RuntimeParameters;
use convoy_core::domain::runtime::{
    MetricSample, RolloutPhase, RuntimeSnapshot, ScalingDecision, ScalingOutcome,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::autoscaling::AutoscalingPolicy;
use super::platform::{RunningTask, TaskPlatform};
use super::{AutoscalingSettings, RuntimeSettings};

pub(super) struct RuntimeState {
    pub current_image: Option<String>,
    pub phase: RolloutPhase,
    pub tasks: Vec<RunningTask>,
}

/// Long-lived runtime of one service in one environment
pub struct ServiceRuntime {
    service: String,
    environment: String,
    pub(super) platform: Arc<dyn TaskPlatform>,
    pub(super) settings: RuntimeSettings,
    desired: AtomicU32,
    pub(super) state: Mutex<RuntimeState>,
    /// Held for the whole of a rollout; whoever holds it owns the task set
    pub(super) deploy_gate: Mutex<()>,
    policy: Mutex<AutoscalingPolicy>,
}

impl ServiceRuntime {
    /// Creates an empty runtime; nothing runs until the first deploy
    pub fn new(
        service: impl Into<String>,
        environment: impl Into<String>,
        parameters: &RuntimeParameters,
        platform: Arc<dyn TaskPlatform>,
        settings: RuntimeSettings,
        autoscaling: AutoscalingSettings,
    ) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
            platform,
            settings,
            desired: AtomicU32::new(parameters.desired_count),
            state: Mutex::new(RuntimeState {
                current_image: None,
                phase: RolloutPhase::Stable,
                tasks: Vec::new(),
            }),
            deploy_gate: Mutex::new(()),
            policy: Mutex::new(AutoscalingPolicy::new(parameters, autoscaling)),
        }
    }

    /// Takes ownership of tasks that were running before this runtime existed
    ///
    /// The image most of them run becomes the current image, so the next
    /// deploy drains them and a rollback restores it.
    pub async fn adopt(&self, tasks: Vec<RunningTask>) {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for task in &tasks {
            match counts.iter_mut().find(|(image, _)| *image == task.image) {
                Some((_, count)) => *count += 1,
                None => counts.push((task.image.as_str(), 1)),
            }
        }
        let current_image = counts
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(image, _)| image.to_string());

        info!(
            "{}/{} adopted {} running tasks (image: {})",
            self.service,
            self.environment,
            tasks.len(),
            current_image.as_deref().unwrap_or("none")
        );

        let mut state = self.state.lock().await;
        state.current_image = current_image;
        state.tasks = tasks;
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn desired_count(&self) -> u32 {
        self.desired.load(Ordering::SeqCst)
    }

    /// Sets the desired count only if it still equals `expected`
    pub fn compare_and_set_desired(&self, expected: u32, new: u32) -> bool {
        self.desired
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub async fn current_image(&self) -> Option<String> {
        self.state.lock().await.current_image.clone()
    }

    pub async fn phase(&self) -> RolloutPhase {
        self.state.lock().await.phase
    }

    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let (min_capacity, max_capacity, cpu_target, memory_target) = {
            let policy = self.policy.lock().await;
            let (min, max) = policy.bounds();
            let (cpu, memory) = policy.targets();
            (min, max, cpu, memory)
        };
        let state = self.state.lock().await;

        RuntimeSnapshot {
            service: self.service.clone(),
            environment: self.environment.clone(),
            desired_count: self.desired_count(),
            min_capacity,
            max_capacity,
            cpu_target,
            memory_target,
            current_image: state.current_image.clone(),
            phase: state.phase,
            running_tasks: state.tasks.len() as u32,
        }
    }

    /// Replaces capacity bounds and targets, clamping the desired count
    pub async fn configure(&self, parameters: &RuntimeParameters) -> Result<()> {
        parameters
            .validate()
            .map_err(|reason| anyhow::anyhow!("Invalid runtime parameters: {}", reason))?;

        let mut policy = self.policy.lock().await;
        policy.configure(parameters);

        loop {
            let current = self.desired_count();
            let clamped = policy.clamp(current);
            if clamped == current || self.compare_and_set_desired(current, clamped) {
                break;
            }
        }
        drop(policy);

        self.converge_if_idle().await;
        Ok(())
    }

    /// Feeds a utilization sample to the autoscaling loops
    ///
    /// A change in desired count is applied immediately when no rollout is in
    /// progress. During a rollout the count still changes, and the rollout
    /// converges on it when it completes.
    pub async fn observe(&self, sample: MetricSample) -> ScalingDecision {
        let mut policy = self.policy.lock().await;
        policy.record(sample);

        let mut decision = loop {
            let current = self.desired_count();
            let decision = policy.decide(current, sample.observed_at);
            if decision.desired == current
                || self.compare_and_set_desired(current, decision.desired)
            {
                break decision;
            }
        };
        policy.commit(&decision, sample.observed_at);
        drop(policy);

        if decision.desired != decision.previous {
            info!(
                "{}/{} desired count {} -> {} ({:?})",
                self.service, self.environment, decision.previous, decision.desired, decision.outcome
            );
            if !self.converge_if_idle().await {
                decision.outcome = ScalingOutcome::Deferred;
            }
        }

        decision
    }

    /// Converges on the current image unless a rollout owns the task set
    ///
    /// Returns false when a rollout is in progress.
    async fn converge_if_idle(&self) -> bool {
        let Ok(_gate) = self.deploy_gate.try_lock() else {
            debug!(
                "{}/{} is rolling out; convergence deferred",
                self.service, self.environment
            );
            return false;
        };

        let image = self.current_image().await;
        if let Err(e) = self.converge(image.as_deref()).await {
            warn!(
                "{}/{} failed to converge: {:#}",
                self.service, self.environment, e
            );
        }
        true
    }

    /// Brings the task set to `desired` tasks of `image`
    ///
    /// Tasks of any other image are stopped. With no image, every task is
    /// stopped. Repeats until the desired count it converged on is still the
    /// desired count. Callers must hold the deploy gate.
    pub(super) async fn converge(&self, image: Option<&str>) -> Result<()> {
        loop {
            let target = self.desired_count();

            let mut state = self.state.lock().await;
            self.stop_where(&mut state, |task| Some(task.image.as_str()) != image)
                .await?;

            if let Some(image) = image {
                let running = state.tasks.len() as u32;
                if running < target {
                    for _ in running..target {
                        let id = self
                            .platform
                            .launch(&self.service, &self.environment, image)
                            .await?;
                        state.tasks.push(RunningTask {
                            id,
                            image: image.to_string(),
                        });
                    }
                } else if running > target {
                    let excess = state.tasks.split_off(target as usize);
                    for (index, task) in excess.iter().enumerate() {
                        if let Err(e) = self.platform.stop(&task.id).await {
                            state.tasks.extend(excess[index..].iter().cloned());
                            return Err(e);
                        }
                    }
                }
            }
            drop(state);

            if self.desired_count() == target {
                return Ok(());
            }
        }
    }

    /// Stops every task matching `predicate`, keeping those that fail to stop
    pub(super) async fn stop_where<F>(&self, state: &mut RuntimeState, predicate: F) -> Result<()>
    where
        F: Fn(&RunningTask) -> bool,
    {
        let mut kept = Vec::with_capacity(state.tasks.len());
        let mut first_error = None;

        for task in state.tasks.drain(..) {
            if !predicate(&task) {
                kept.push(task);
                continue;
            }
            match self.platform.stop(&task.id).await {
                Ok(()) => debug!("Stopped task {} ({})", task.id, task.image),
                Err(e) => {
                    kept.push(task);
                    first_error.get_or_insert(e);
                }
            }
        }
        state.tasks = kept;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
