//! Runtime Service
//!
//! Read access to the service runtimes hosted by this orchestrator and the
//! entry point for utilization samples.

use convoy_core::domain::runtime::{MetricSample, RuntimeSnapshot, ScalingDecision};
use convoy_core::dto::service::ObserveMetric;
use convoy_runner::runtime::RuntimeRegistry;

/// Service error type
#[derive(Debug)]
pub enum RuntimeError {
    NotFound { service: String, environment: String },
    ValidationError(String),
}

/// Snapshots of every runtime, ordered by service and environment
pub async fn list_runtimes(registry: &RuntimeRegistry) -> Vec<RuntimeSnapshot> {
    let mut snapshots = Vec::new();
    for runtime in registry.list().await {
        snapshots.push(runtime.snapshot().await);
    }
    snapshots
}

/// Snapshot of one runtime
pub async fn get_runtime(
    registry: &RuntimeRegistry,
    service: &str,
    environment: &str,
) -> Result<RuntimeSnapshot, RuntimeError> {
    let runtime = registry
        .get(service, environment)
        .await
        .ok_or_else(|| not_found(service, environment))?;

    Ok(runtime.snapshot().await)
}

/// Feeds a utilization sample, stamped on arrival, to a runtime's policy
pub async fn observe_metric(
    registry: &RuntimeRegistry,
    service: &str,
    environment: &str,
    metric: ObserveMetric,
) -> Result<ScalingDecision, RuntimeError> {
    validate_metric(&metric)?;

    let runtime = registry
        .get(service, environment)
        .await
        .ok_or_else(|| not_found(service, environment))?;

    let decision = runtime
        .observe(MetricSample::now(metric.dimension, metric.utilization))
        .await;

    tracing::debug!(
        "{}/{}: {} at {:.1}% -> {:?}",
        service,
        environment,
        metric.dimension,
        metric.utilization,
        decision.outcome
    );

    Ok(decision)
}

fn not_found(service: &str, environment: &str) -> RuntimeError {
    RuntimeError::NotFound {
        service: service.to_string(),
        environment: environment.to_string(),
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_metric(metric: &ObserveMetric) -> Result<(), RuntimeError> {
    if !metric.utilization.is_finite() || metric.utilization < 0.0 {
        return Err(RuntimeError::ValidationError(format!(
            "Utilization must be a non-negative percentage, got {}",
            metric.utilization
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::domain::environment::{BranchResolution, Environment, RuntimeParameters};
    use convoy_core::domain::runtime::{MetricDimension, ScalingOutcome};
    use convoy_runner::runtime::{LocalProvisioner, SimulatedPlatform};
    use convoy_runner::{InMemorySecretStore, RunnerConfig};
    use std::sync::Arc;

    fn registry() -> RuntimeRegistry {
        let config = RunnerConfig::default();
        let provisioner = LocalProvisioner::new(
            Arc::new(SimulatedPlatform::new()),
            config.runtime_settings(),
            config.autoscaling_settings(),
            Arc::new(InMemorySecretStore::new()),
        );
        RuntimeRegistry::new(Arc::new(provisioner))
    }

    fn environment() -> Environment {
        Environment {
            name: "dev".to_string(),
            branch: "dev".to_string(),
            runtime: RuntimeParameters::default(),
            resolution: BranchResolution::Mapped,
        }
    }

    #[tokio::test]
    async fn test_unknown_runtime() {
        let registry = registry();
        let result = get_runtime(&registry, "svc", "dev").await;
        assert!(matches!(result, Err(RuntimeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_observe_scales_up() {
        let registry = registry();
        registry
            .get_or_provision("svc", &environment())
            .await
            .unwrap();

        let decision = observe_metric(
            &registry,
            "svc",
            "dev",
            ObserveMetric {
                dimension: MetricDimension::Cpu,
                utilization: 80.0,
            },
        )
        .await
        .unwrap();

        assert_eq!(decision.outcome, ScalingOutcome::ScaledUp);
        assert_eq!(decision.desired, 2);
        assert_eq!(list_runtimes(&registry).await[0].desired_count, 2);
    }

    #[tokio::test]
    async fn test_negative_utilization_rejected() {
        let registry = registry();
        let result = observe_metric(
            &registry,
            "svc",
            "dev",
            ObserveMetric {
                dimension: MetricDimension::Memory,
                utilization: -1.0,
            },
        )
        .await;
        assert!(matches!(result, Err(RuntimeError::ValidationError(_))));
    }
}
