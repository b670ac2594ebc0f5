//! Runner configuration
//!
//! Defines the tunables of the execution engine: workspace location, stage
//! parallelism, rollout timing and autoscaling damping.

use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::{AutoscalingSettings, RuntimeSettings};

/// Execution engine configuration
///
/// All intervals are configurable so tests and local runs can shrink them
/// while production keeps conservative values.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base directory for per-run workspaces
    pub workspace_base: PathBuf,

    /// Container image for actions that do not name one
    pub default_container_image: String,

    /// Maximum number of actions of one stage running at once
    pub max_parallel_actions: usize,

    /// How often rollout health is polled
    pub health_poll_interval: Duration,

    /// Rollback convergence attempts before escalating
    pub rollback_max_attempts: u32,

    /// Delay before the first rollback retry; doubles per attempt
    pub rollback_backoff: Duration,

    /// Window the autoscaling loops average utilization over
    pub metric_window: Duration,

    /// Minimum time between two scale-ups
    pub scale_up_cooldown: Duration,

    /// Minimum time after any scaling event before scaling down
    pub scale_down_cooldown: Duration,
}

impl RunnerConfig {
    /// Creates a configuration with defaults rooted at `workspace_base`
    pub fn new(workspace_base: PathBuf) -> Self {
        Self {
            workspace_base,
            default_container_image: "docker.io/alpine:latest".to_string(),
            max_parallel_actions: 4,
            health_poll_interval: Duration::from_secs(5),
            rollback_max_attempts: 5,
            rollback_backoff: Duration::from_secs(2),
            metric_window: Duration::from_secs(300),
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - WORKSPACE_BASE (default: system temp dir + "/convoy")
    /// - DEFAULT_CONTAINER_IMAGE (default: docker.io/alpine:latest)
    /// - MAX_PARALLEL_ACTIONS (default: 4)
    /// - HEALTH_POLL_INTERVAL (seconds, default: 5)
    /// - ROLLBACK_MAX_ATTEMPTS (default: 5)
    /// - ROLLBACK_BACKOFF (seconds, default: 2)
    /// - METRIC_WINDOW (seconds, default: 300)
    /// - SCALE_UP_COOLDOWN (seconds, default: 60)
    /// - SCALE_DOWN_COOLDOWN (seconds, default: 300)
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace_base = std::env::var("WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("convoy"));

        let mut config = Self::new(workspace_base);

        if let Ok(image) = std::env::var("DEFAULT_CONTAINER_IMAGE") {
            config.default_container_image = image;
        }
        if let Some(value) = env_parse::<usize>("MAX_PARALLEL_ACTIONS")? {
            config.max_parallel_actions = value;
        }
        if let Some(value) = env_parse::<u64>("HEALTH_POLL_INTERVAL")? {
            config.health_poll_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u32>("ROLLBACK_MAX_ATTEMPTS")? {
            config.rollback_max_attempts = value;
        }
        if let Some(value) = env_parse::<u64>("ROLLBACK_BACKOFF")? {
            config.rollback_backoff = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>("METRIC_WINDOW")? {
            config.metric_window = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>("SCALE_UP_COOLDOWN")? {
            config.scale_up_cooldown = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>("SCALE_DOWN_COOLDOWN")? {
            config.scale_down_cooldown = Duration::from_secs(value);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_container_image.trim().is_empty() {
            anyhow::bail!("default_container_image cannot be empty");
        }

        if self.max_parallel_actions == 0 {
            anyhow::bail!("max_parallel_actions must be greater than 0");
        }

        if self.health_poll_interval.is_zero() {
            anyhow::bail!("health_poll_interval must be greater than 0");
        }

        if self.rollback_max_attempts == 0 {
            anyhow::bail!("rollback_max_attempts must be greater than 0");
        }

        if self.metric_window.is_zero() {
            anyhow::bail!("metric_window must be greater than 0");
        }

        if self.scale_down_cooldown < self.scale_up_cooldown {
            anyhow::bail!("scale_down_cooldown must not be shorter than scale_up_cooldown");
        }

        Ok(())
    }

    /// Rollout timing for service runtimes created by this engine
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            health_poll_interval: self.health_poll_interval,
            rollback_max_attempts: self.rollback_max_attempts,
            rollback_backoff: self.rollback_backoff,
        }
    }

    /// Autoscaling damping for service runtimes created by this engine
    pub fn autoscaling_settings(&self) -> AutoscalingSettings {
        AutoscalingSettings {
            window: self.metric_window,
            scale_up_cooldown: self.scale_up_cooldown,
            scale_down_cooldown: self.scale_down_cooldown,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("convoy"))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}
