//! Service runtimes
//!
//! A service runtime is the long-lived set of tasks serving one service in one
//! environment. It owns:
//! - the desired task count, changed only by compare-and-set
//! - the rollout state machine (circuit breaker and rollback)
//! - the autoscaling policy feeding the desired count

mod autoscaling;
mod platform;
mod provision;
mod rollout;
mod service;

pub use autoscaling::AutoscalingPolicy;
pub use platform::{
    HealthBehavior, PodmanTaskPlatform, RunningTask, SimulatedPlatform, TaskId, TaskPlatform,
};
pub use provision::{
    ConnectionSecretHandle, DatabaseConfig, LocalProvisioner, Provisioner, RuntimeConfig,
    RuntimeRegistry, ServiceRuntimeHandle,
};
pub use rollout::{DeployError, DeployOutcome, DeployRequest};
pub use service::ServiceRuntime;

use std::time::Duration;

/// Rollout and rollback timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub health_poll_interval: Duration,
    pub rollback_max_attempts: u32,
    /// Delay before the first rollback retry; doubles per attempt
    pub rollback_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(5),
            rollback_max_attempts: 5,
            rollback_backoff: Duration::from_secs(2),
        }
    }
}

/// Damping of the autoscaling loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscalingSettings {
    /// Samples older than this (relative to the newest) no longer vote
    pub window: Duration,
    pub scale_up_cooldown: Duration,
    /// Measured from the last scaling event in either direction
    pub scale_down_cooldown: Duration,
}

impl Default for AutoscalingSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
        }
    }
}
