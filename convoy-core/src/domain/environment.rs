//! Environment domain types
//!
//! An environment (`dev`, `test`, `prod`, ...) maps to exactly one source
//! branch and one set of runtime parameters. The table is immutable
//! configuration handed to pipeline construction; branch selection happens
//! once per run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while resolving or validating environments
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvironmentError {
    #[error("environment name cannot be empty")]
    EmptyName,

    #[error("environment '{0}' has an empty branch")]
    EmptyBranch(String),

    #[error("environment '{0}' is not mapped to a branch")]
    Unmapped(String),

    #[error("invalid runtime parameters for environment '{environment}': {reason}")]
    InvalidRuntime { environment: String, reason: String },
}

/// Capacity and scaling targets of a service runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParameters {
    pub desired_count: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// Target CPU utilization, percent
    pub cpu_target: f64,
    /// Target memory utilization, percent
    pub memory_target: f64,
}

impl Default for RuntimeParameters {
    fn default() -> Self {
        Self {
            desired_count: 1,
            min_capacity: 1,
            max_capacity: 4,
            cpu_target: 50.0,
            memory_target: 50.0,
        }
    }
}

impl RuntimeParameters {
    /// Checks bounds and targets
    pub fn validate(&self) -> Result<(), String> {
        if self.min_capacity == 0 {
            return Err("min capacity must be at least 1".to_string());
        }
        if self.min_capacity > self.max_capacity {
            return Err(format!(
                "min capacity {} exceeds max capacity {}",
                self.min_capacity, self.max_capacity
            ));
        }
        if self.desired_count < self.min_capacity || self.desired_count > self.max_capacity {
            return Err(format!(
                "desired count {} outside [{}, {}]",
                self.desired_count, self.min_capacity, self.max_capacity
            ));
        }
        for (name, target) in [("cpu", self.cpu_target), ("memory", self.memory_target)] {
            if !(target > 0.0 && target <= 100.0) {
                return Err(format!("{} target {} must be in (0, 100]", name, target));
            }
        }
        Ok(())
    }
}

/// What happens when a run targets an environment missing from the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchFallback {
    /// Use the environment name itself as the branch name
    #[default]
    #[serde(rename = "environment")]
    EnvironmentName,
    /// Refuse to instantiate the pipeline
    Reject,
}

/// How a run's branch was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchResolution {
    Mapped,
    Fallback,
}

/// Table entry for one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub branch: String,
    /// Overrides the table default when present
    pub runtime: Option<RuntimeParameters>,
}

/// A resolved deployment target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub branch: String,
    pub runtime: RuntimeParameters,
    pub resolution: BranchResolution,
}

/// Immutable environment -> branch/runtime table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTable {
    entries: BTreeMap<String, EnvironmentConfig>,
    fallback: BranchFallback,
    default_runtime: RuntimeParameters,
}

impl Default for EnvironmentTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            fallback: BranchFallback::default(),
            default_runtime: RuntimeParameters::default(),
        }
    }
}

impl EnvironmentTable {
    /// Builds a table, validating every entry
    pub fn new(
        entries: BTreeMap<String, EnvironmentConfig>,
        fallback: BranchFallback,
        default_runtime: RuntimeParameters,
    ) -> Result<Self, EnvironmentError> {
        default_runtime
            .validate()
            .map_err(|reason| EnvironmentError::InvalidRuntime {
                environment: "<default>".to_string(),
                reason,
            })?;

        for (name, config) in &entries {
            if name.trim().is_empty() {
                return Err(EnvironmentError::EmptyName);
            }
            if config.branch.trim().is_empty() {
                return Err(EnvironmentError::EmptyBranch(name.clone()));
            }
            if let Some(runtime) = &config.runtime {
                runtime
                    .validate()
                    .map_err(|reason| EnvironmentError::InvalidRuntime {
                        environment: name.clone(),
                        reason,
                    })?;
            }
        }

        Ok(Self {
            entries,
            fallback,
            default_runtime,
        })
    }

    pub fn fallback(&self) -> BranchFallback {
        self.fallback
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Resolves an environment name to its branch and runtime parameters
    ///
    /// Unmapped names fall back to `branch == name` unless the table rejects them.
    pub fn resolve(&self, name: &str) -> Result<Environment, EnvironmentError> {
        if name.trim().is_empty() {
            return Err(EnvironmentError::EmptyName);
        }

        match self.entries.get(name) {
            Some(config) => Ok(Environment {
                name: name.to_string(),
                branch: config.branch.clone(),
                runtime: config
                    .runtime
                    .clone()
                    .unwrap_or_else(|| self.default_runtime.clone()),
                resolution: BranchResolution::Mapped,
            }),
            None => match self.fallback {
                BranchFallback::EnvironmentName => Ok(Environment {
                    name: name.to_string(),
                    branch: name.to_string(),
                    runtime: self.default_runtime.clone(),
                    resolution: BranchResolution::Fallback,
                }),
                BranchFallback::Reject => Err(EnvironmentError::Unmapped(name.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(fallback: BranchFallback) -> EnvironmentTable {
        let mut entries = BTreeMap::new();
        entries.insert(
            "dev".to_string(),
            EnvironmentConfig {
                branch: "dev".to_string(),
                runtime: None,
            },
        );
        entries.insert(
            "prod".to_string(),
            EnvironmentConfig {
                branch: "main".to_string(),
                runtime: Some(RuntimeParameters {
                    desired_count: 2,
                    min_capacity: 2,
                    max_capacity: 10,
                    cpu_target: 60.0,
                    memory_target: 70.0,
                }),
            },
        );
        EnvironmentTable::new(entries, fallback, RuntimeParameters::default()).unwrap()
    }

    #[test]
    fn test_resolve_mapped_environment() {
        let env = table(BranchFallback::EnvironmentName).resolve("prod").unwrap();
        assert_eq!(env.branch, "main");
        assert_eq!(env.runtime.max_capacity, 10);
        assert_eq!(env.resolution, BranchResolution::Mapped);
    }

    #[test]
    fn test_resolve_uses_default_runtime() {
        let env = table(BranchFallback::EnvironmentName).resolve("dev").unwrap();
        assert_eq!(env.runtime, RuntimeParameters::default());
    }

    #[test]
    fn test_unmapped_environment_falls_back_to_its_name() {
        let env = table(BranchFallback::EnvironmentName)
            .resolve("feature-x")
            .unwrap();
        assert_eq!(env.branch, "feature-x");
        assert_eq!(env.resolution, BranchResolution::Fallback);
    }

    #[test]
    fn test_unmapped_environment_rejected() {
        let result = table(BranchFallback::Reject).resolve("feature-x");
        assert_eq!(
            result,
            Err(EnvironmentError::Unmapped("feature-x".to_string()))
        );
    }

    #[test]
    fn test_invalid_runtime_rejected() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "dev".to_string(),
            EnvironmentConfig {
                branch: "dev".to_string(),
                runtime: Some(RuntimeParameters {
                    desired_count: 1,
                    min_capacity: 5,
                    max_capacity: 2,
                    cpu_target: 50.0,
                    memory_target: 50.0,
                }),
            },
        );
        let result = EnvironmentTable::new(
            entries,
            BranchFallback::EnvironmentName,
            RuntimeParameters::default(),
        );
        assert!(matches!(
            result,
            Err(EnvironmentError::InvalidRuntime { .. })
        ));
    }

    #[test]
    fn test_runtime_parameter_validation() {
        assert!(RuntimeParameters::default().validate().is_ok());

        let mut params = RuntimeParameters::default();
        params.cpu_target = 0.0;
        assert!(params.validate().is_err());

        let mut params = RuntimeParameters::default();
        params.desired_count = 9;
        assert!(params.validate().is_err());
    }
}
