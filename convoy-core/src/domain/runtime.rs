//! Service runtime domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource dimension an autoscaling loop watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDimension {
    Cpu,
    Memory,
}

impl fmt::Display for MetricDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricDimension::Cpu => write!(f, "cpu"),
            MetricDimension::Memory => write!(f, "memory"),
        }
    }
}

/// Utilization sample, percent of allocated capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub dimension: MetricDimension,
    pub utilization: f64,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

impl MetricSample {
    pub fn now(dimension: MetricDimension, utilization: f64) -> Self {
        Self {
            dimension,
            utilization,
            observed_at: chrono::Utc::now(),
        }
    }
}

/// Phase of the rollout state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutPhase {
    Stable,
    RollingOut,
    Healthy,
    RollingBack,
    /// Rollback did not converge; the runtime needs an operator
    Failed,
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RolloutPhase::Stable => "stable",
            RolloutPhase::RollingOut => "rolling-out",
            RolloutPhase::Healthy => "healthy",
            RolloutPhase::RollingBack => "rolling-back",
            RolloutPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What an autoscaling observation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingOutcome {
    ScaledUp,
    ScaledDown,
    Unchanged,
    /// A change was wanted but the cooldown has not elapsed
    CoolingDown,
    /// Desired count changed while a rollout owned the task set; tasks
    /// follow once it completes
    Deferred,
}

/// Result of feeding one sample to the autoscaling policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub previous: u32,
    pub desired: u32,
    pub cpu_recommendation: Option<u32>,
    pub memory_recommendation: Option<u32>,
    pub outcome: ScalingOutcome,
}

/// Point-in-time view of a service runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub service: String,
    pub environment: String,
    pub desired_count: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub cpu_target: f64,
    pub memory_target: f64,
    pub current_image: Option<String>,
    pub phase: RolloutPhase,
    pub running_tasks: u32,
}
