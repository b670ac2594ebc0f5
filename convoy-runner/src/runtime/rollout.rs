//! Rolling deploys with an automatic circuit breaker
//!
//! ```text
//! rolling-out -> healthy -> stable          health threshold reached in time
//! rolling-out -> rolling-back -> stable     breaker tripped, previous image restored
//! rolling-back -> failed                    rollback did not converge
//! ```
//!
//! The current image only changes once the new tasks are healthy, so a
//! rolled-back runtime still reports the image it had before the deploy.

use convoy_core::domain::failure::FailureKind;
use convoy_core::domain::runtime::RolloutPhase;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::platform::{RunningTask, TaskId};
use super::service::ServiceRuntime;

/// A rollout request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Registry-qualified image reference
    pub image: String,
    pub grace_period: Duration,
    /// Share of desired tasks that must pass health checks, 1..=100
    pub min_healthy_percent: u32,
}

/// What a successful deploy did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The image was already current and stable; nothing changed
    Unchanged,
    Deployed { previous: Option<String> },
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(
        "{image} did not pass health checks within {grace_secs}s; rolled back to {}",
        restored.as_deref().unwrap_or("no image")
    )]
    HealthCheckTimeout {
        image: String,
        restored: Option<String>,
        grace_secs: u64,
    },

    #[error("failed to launch {image}: {reason}; rolled back to {}", restored.as_deref().unwrap_or("no image"))]
    LaunchFailed {
        image: String,
        restored: Option<String>,
        reason: String,
    },

    #[error("{image} is healthy but old tasks could not be drained after {attempts} attempts: {reason}")]
    DrainFailed {
        image: String,
        attempts: u32,
        reason: String,
    },

    #[error(
        "rollback to {} failed after {attempts} attempts: {reason}",
        previous.as_deref().unwrap_or("no image")
    )]
    RollbackFailed {
        previous: Option<String>,
        attempts: u32,
        reason: String,
    },

    #[error("artifact is not a deployable image: {0}")]
    NotAnImage(String),

    #[error("failed to provision runtime: {0}")]
    Provisioning(String),
}

impl DeployError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeployError::HealthCheckTimeout { .. } => FailureKind::DeployHealthCheckTimeout,
            DeployError::RollbackFailed { .. } => FailureKind::RollbackFailed,
            DeployError::LaunchFailed { .. }
            | DeployError::DrainFailed { .. }
            | DeployError::NotAnImage(_)
            | DeployError::Provisioning(_) => FailureKind::DeployFailure,
        }
    }
}

/// Number of healthy tasks a rollout needs before old tasks are drained
pub(super) fn healthy_threshold(desired: u32, min_healthy_percent: u32) -> u32 {
    (desired * min_healthy_percent).div_ceil(100).max(1)
}

impl ServiceRuntime {
    /// Rolls `request.image` out, rolling back if it does not become healthy
    ///
    /// Deploys are serialized per runtime. Deploying the current image to a
    /// stable runtime is a no-op.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let _gate = self.deploy_gate.lock().await;

        let previous = {
            let mut state = self.state.lock().await;
            if state.current_image.as_deref() == Some(request.image.as_str())
                && state.phase == RolloutPhase::Stable
            {
                debug!("{} already runs {}", self.service(), request.image);
                return Ok(DeployOutcome::Unchanged);
            }
            state.phase = RolloutPhase::RollingOut;
            state.current_image.clone()
        };

        info!(
            "Rolling out {} to {}/{} (previous: {})",
            request.image,
            self.service(),
            self.environment(),
            previous.as_deref().unwrap_or("none")
        );

        let desired = self.desired_count();
        let threshold = healthy_threshold(desired, request.min_healthy_percent);

        let launched = match self.launch_new(&request.image, desired).await {
            Ok(launched) => launched,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Launch of {} failed: {}", request.image, reason);
                self.roll_back(previous.as_deref()).await?;
                return Err(DeployError::LaunchFailed {
                    image: request.image.clone(),
                    restored: previous,
                    reason,
                });
            }
        };

        if !self
            .await_healthy(&launched, threshold, request.grace_period)
            .await
        {
            warn!(
                "{} did not reach {}/{} healthy tasks within {:?}; rolling back",
                request.image, threshold, desired, request.grace_period
            );
            self.roll_back(previous.as_deref()).await?;
            return Err(DeployError::HealthCheckTimeout {
                image: request.image.clone(),
                restored: previous,
                grace_secs: request.grace_period.as_secs(),
            });
        }

        {
            let mut state = self.state.lock().await;
            state.phase = RolloutPhase::Healthy;
            state.current_image = Some(request.image.clone());
        }

        if let Err((attempts, reason)) = self.converge_with_retry(Some(&request.image)).await {
            error!("Draining old tasks after rollout of {} failed: {}", request.image, reason);
            self.set_phase(RolloutPhase::Failed).await;
            return Err(DeployError::DrainFailed {
                image: request.image.clone(),
                attempts,
                reason,
            });
        }

        self.set_phase(RolloutPhase::Stable).await;
        info!("{}/{} now runs {}", self.service(), self.environment(), request.image);

        Ok(DeployOutcome::Deployed { previous })
    }

    async fn set_phase(&self, phase: RolloutPhase) {
        self.state.lock().await.phase = phase;
    }

    /// Launches `count` tasks of `image` next to the existing ones
    async fn launch_new(&self, image: &str, count: u32) -> anyhow::Result<Vec<TaskId>> {
        let mut launched = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self
                .platform
                .launch(self.service(), self.environment(), image)
                .await?;
            self.state.lock().await.tasks.push(RunningTask {
                id: id.clone(),
                image: image.to_string(),
            });
            launched.push(id);
        }
        Ok(launched)
    }

    /// Polls health until `threshold` of `tasks` pass or the grace period ends
    async fn await_healthy(&self, tasks: &[TaskId], threshold: u32, grace_period: Duration) -> bool {
        let deadline = Instant::now() + grace_period;

        loop {
            let mut healthy = 0;
            for task in tasks {
                match self.platform.is_healthy(task).await {
                    Ok(true) => healthy += 1,
                    Ok(false) => {}
                    Err(e) => debug!("Health check of {} failed: {:#}", task, e),
                }
            }
            if healthy >= threshold {
                debug!("{}/{} tasks healthy", healthy, tasks.len());
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.health_poll_interval.min(deadline - now)).await;
        }
    }

    /// Restores `previous`, escalating to `RollbackFailed` if it never converges
    async fn roll_back(&self, previous: Option<&str>) -> Result<(), DeployError> {
        self.set_phase(RolloutPhase::RollingBack).await;

        match self.converge_with_retry(previous).await {
            Ok(()) => {
                self.set_phase(RolloutPhase::Stable).await;
                info!(
                    "{}/{} rolled back to {}",
                    self.service(),
                    self.environment(),
                    previous.unwrap_or("no image")
                );
                Ok(())
            }
            Err((attempts, reason)) => {
                error!(
                    "Rollback of {}/{} failed after {} attempts: {}",
                    self.service(),
                    self.environment(),
                    attempts,
                    reason
                );
                self.set_phase(RolloutPhase::Failed).await;
                Err(DeployError::RollbackFailed {
                    previous: previous.map(str::to_string),
                    attempts,
                    reason,
                })
            }
        }
    }

    /// Converges on `image`, retrying with exponential backoff
    async fn converge_with_retry(&self, image: Option<&str>) -> Result<(), (u32, String)> {
        let attempts = self.settings.rollback_max_attempts.max(1);
        let mut backoff = self.settings.rollback_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.converge(image).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(
                        "Convergence attempt {}/{} failed: {}",
                        attempt, attempts, last_error
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err((attempts, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::platform::{HealthBehavior, SimulatedPlatform};
    use crate::runtime::{AutoscalingSettings, RuntimeSettings};
    use convoy_core::domain::environment::RuntimeParameters;
    use std::sync::Arc;

    fn runtime(platform: Arc<SimulatedPlatform>, desired: u32) -> ServiceRuntime {
        let parameters = RuntimeParameters {
            desired_count: desired,
            min_capacity: 1,
            max_capacity: 4,
            cpu_target: 50.0,
            memory_target: 50.0,
        };
        ServiceRuntime::new(
            "svc",
            "dev",
            &parameters,
            platform,
            RuntimeSettings {
                health_poll_interval: Duration::from_millis(2),
                rollback_max_attempts: 3,
                rollback_backoff: Duration::from_millis(1),
            },
            AutoscalingSettings::default(),
        )
    }

    fn request(image: &str) -> DeployRequest {
        DeployRequest {
            image: image.to_string(),
            grace_period: Duration::from_millis(50),
            min_healthy_percent: 100,
        }
    }

    #[test]
    fn test_healthy_threshold() {
        assert_eq!(healthy_threshold(4, 100), 4);
        assert_eq!(healthy_threshold(4, 50), 2);
        assert_eq!(healthy_threshold(3, 50), 2);
        assert_eq!(healthy_threshold(1, 1), 1);
    }

    #[tokio::test]
    async fn test_successful_deploy_replaces_tasks() {
        let platform = Arc::new(SimulatedPlatform::new());
        let runtime = runtime(platform.clone(), 2);

        runtime.deploy(&request("registry/svc:aaa")).await.unwrap();
        let outcome = runtime.deploy(&request("registry/svc:bbb")).await.unwrap();

        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                previous: Some("registry/svc:aaa".to_string())
            }
        );
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:bbb")
        );
        assert_eq!(runtime.phase().await, RolloutPhase::Stable);
        assert_eq!(
            platform.running_images().await,
            vec!["registry/svc:bbb", "registry/svc:bbb"]
        );
    }

    #[tokio::test]
    async fn test_redeploying_current_image_is_noop() {
        let platform = Arc::new(SimulatedPlatform::new());
        let runtime = runtime(platform.clone(), 2);

        runtime.deploy(&request("registry/svc:aaa")).await.unwrap();
        let launches = platform.launch_count();

        let outcome = runtime.deploy(&request("registry/svc:aaa")).await.unwrap();
        assert_eq!(outcome, DeployOutcome::Unchanged);
        assert_eq!(platform.launch_count(), launches);
        assert_eq!(runtime.desired_count(), 2);
    }

    #[tokio::test]
    async fn test_breaker_restores_previous_image() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform
            .set_behavior("registry/svc:bad", HealthBehavior::Never)
            .await;
        let runtime = runtime(platform.clone(), 2);

        runtime.deploy(&request("registry/svc:good")).await.unwrap();
        let result = runtime.deploy(&request("registry/svc:bad")).await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), FailureKind::DeployHealthCheckTimeout);
        assert!(matches!(
            error,
            DeployError::HealthCheckTimeout { restored: Some(ref image), .. } if image == "registry/svc:good"
        ));
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:good")
        );
        assert_eq!(runtime.phase().await, RolloutPhase::Stable);
        assert_eq!(
            platform.running_images().await,
            vec!["registry/svc:good", "registry/svc:good"]
        );
    }

    #[tokio::test]
    async fn test_partial_health_threshold() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform
            .set_behavior("registry/svc:slow", HealthBehavior::HealthyAfter(2))
            .await;
        let runtime = runtime(platform.clone(), 4);

        let mut req = request("registry/svc:slow");
        req.min_healthy_percent = 50;
        req.grace_period = Duration::from_secs(5);

        assert!(runtime.deploy(&req).await.is_ok());
        assert_eq!(runtime.phase().await, RolloutPhase::Stable);
    }

    #[tokio::test]
    async fn test_rollback_retries_then_converges() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform
            .set_behavior("registry/svc:bad", HealthBehavior::Never)
            .await;
        let runtime = runtime(platform.clone(), 1);

        runtime.deploy(&request("registry/svc:good")).await.unwrap();
        platform.fail_next_stops(2);

        let error = runtime.deploy(&request("registry/svc:bad")).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::DeployHealthCheckTimeout);
        assert_eq!(platform.running_images().await, vec!["registry/svc:good"]);
    }

    #[tokio::test]
    async fn test_rollback_escalates_when_it_cannot_converge() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform
            .set_behavior("registry/svc:bad", HealthBehavior::Never)
            .await;
        let runtime = runtime(platform.clone(), 1);

        runtime.deploy(&request("registry/svc:good")).await.unwrap();
        platform.fail_next_stops(100);

        let error = runtime.deploy(&request("registry/svc:bad")).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::RollbackFailed);
        assert!(matches!(error, DeployError::RollbackFailed { attempts: 3, .. }));
        assert_eq!(runtime.phase().await, RolloutPhase::Failed);
        assert_eq!(
            runtime.current_image().await.as_deref(),
            Some("registry/svc:good")
        );
    }

    #[tokio::test]
    async fn test_first_deploy_failure_leaves_nothing_running() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform
            .set_behavior("registry/svc:bad", HealthBehavior::Never)
            .await;
        let runtime = runtime(platform.clone(), 2);

        let error = runtime.deploy(&request("registry/svc:bad")).await.unwrap_err();
        assert!(matches!(
            error,
            DeployError::HealthCheckTimeout { restored: None, .. }
        ));
        assert_eq!(runtime.current_image().await, None);
        assert_eq!(platform.running_count().await, 0);
    }
}
