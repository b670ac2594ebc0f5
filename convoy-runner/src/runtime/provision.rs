//! Runtime and database provisioning
//!
//! Runtimes are created once per `(service, environment)` the first time a
//! run targets that environment, and reused afterwards. A new runtime adopts
//! the tasks the platform already runs for it, so state survives a restart. Databases a pipeline
//! migrates get a connection secret the same way, one per environment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use convoy_core::domain::action::{ActionSpec, SecretRef};
use convoy_core::domain::environment::{Environment, RuntimeParameters};
use convoy_core::domain::pipeline::Pipeline;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use super::platform::TaskPlatform;
use super::service::ServiceRuntime;
use super::{AutoscalingSettings, RuntimeSettings};
use crate::secrets::{DatabaseCredentials, InMemorySecretStore, SecretStore};

pub type ServiceRuntimeHandle = Arc<ServiceRuntime>;

/// What to create a runtime for
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub service: String,
    pub environment: String,
    pub parameters: RuntimeParameters,
}

/// What to create a database for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub database: String,
    /// Name the connection secret is stored under
    pub secret: SecretRef,
}

/// Reference to a provisioned database's connection secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecretHandle {
    pub secret: SecretRef,
}

/// Creates service runtimes and databases
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_runtime(&self, config: RuntimeConfig) -> Result<ServiceRuntimeHandle>;

    /// Creates a database, or returns the handle of the existing one
    async fn create_database(&self, config: DatabaseConfig) -> Result<ConnectionSecretHandle>;
}

/// Provisions runtimes on a task platform of this host
///
/// Databases are expected to live on a server reachable at `db_host`; this
/// provisioner only issues their connection secrets.
pub struct LocalProvisioner {
    platform: Arc<dyn TaskPlatform>,
    settings: RuntimeSettings,
    autoscaling: AutoscalingSettings,
    secrets: Arc<InMemorySecretStore>,
    db_host: String,
    db_port: u16,
}

impl LocalProvisioner {
    pub fn new(
        platform: Arc<dyn TaskPlatform>,
        settings: RuntimeSettings,
        autoscaling: AutoscalingSettings,
        secrets: Arc<InMemorySecretStore>,
    ) -> Self {
        Self {
            platform,
            settings,
            autoscaling,
            secrets,
            db_host: "localhost".to_string(),
            db_port: 5432,
        }
    }

    pub fn with_database_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.db_host = host.into();
        self.db_port = port;
        self
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn create_runtime(&self, config: RuntimeConfig) -> Result<ServiceRuntimeHandle> {
        config
            .parameters
            .validate()
            .map_err(|reason| anyhow::anyhow!("Invalid runtime parameters: {}", reason))?;

        info!(
            "Provisioning runtime {}/{} (desired {}, bounds [{}, {}])",
            config.service,
            config.environment,
            config.parameters.desired_count,
            config.parameters.min_capacity,
            config.parameters.max_capacity
        );

        let existing = self
            .platform
            .list(&config.service, &config.environment)
            .await
            .with_context(|| {
                format!(
                    "Failed to list running tasks of {}/{}",
                    config.service, config.environment
                )
            })?;

        let runtime = ServiceRuntime::new(
            config.service,
            config.environment,
            &config.parameters,
            Arc::clone(&self.platform),
            self.settings,
            self.autoscaling,
        );
        if !existing.is_empty() {
            runtime.adopt(existing).await;
        }

        Ok(Arc::new(runtime))
    }

    async fn create_database(&self, config: DatabaseConfig) -> Result<ConnectionSecretHandle> {
        if !self.secrets.contains(&config.secret).await {
            info!(
                "Issuing connection secret {} for database {}",
                config.secret, config.database
            );
            let username: String = config
                .database
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();

            self.secrets
                .insert(
                    config.secret.clone(),
                    DatabaseCredentials {
                        host: self.db_host.clone(),
                        port: self.db_port,
                        dbname: username.clone(),
                        username,
                        password: Uuid::new_v4().simple().to_string(),
                    },
                )
                .await;
        }

        Ok(ConnectionSecretHandle {
            secret: config.secret,
        })
    }
}

type RuntimeKey = (String, String);

/// Live service runtimes, keyed by `(service, environment)`
pub struct RuntimeRegistry {
    provisioner: Arc<dyn Provisioner>,
    runtimes: RwLock<HashMap<RuntimeKey, ServiceRuntimeHandle>>,
    /// Serializes provisioning so a runtime is never created twice
    provisioning: Mutex<()>,
}

impl RuntimeRegistry {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            runtimes: RwLock::new(HashMap::new()),
            provisioning: Mutex::new(()),
        }
    }

    pub async fn get(&self, service: &str, environment: &str) -> Option<ServiceRuntimeHandle> {
        self.runtimes
            .read()
            .await
            .get(&(service.to_string(), environment.to_string()))
            .cloned()
    }

    /// Every runtime, ordered by service then environment
    pub async fn list(&self) -> Vec<ServiceRuntimeHandle> {
        let runtimes = self.runtimes.read().await;
        let mut keys: Vec<&RuntimeKey> = runtimes.keys().collect();
        keys.sort();
        keys.into_iter().map(|key| Arc::clone(&runtimes[key])).collect()
    }

    /// Returns the runtime of `service` in `environment`, creating it if needed
    pub async fn get_or_provision(
        &self,
        service: &str,
        environment: &Environment,
    ) -> Result<ServiceRuntimeHandle> {
        if let Some(runtime) = self.get(service, &environment.name).await {
            return Ok(runtime);
        }

        let _provisioning = self.provisioning.lock().await;
        if let Some(runtime) = self.get(service, &environment.name).await {
            return Ok(runtime);
        }

        let runtime = self
            .provisioner
            .create_runtime(RuntimeConfig {
                service: service.to_string(),
                environment: environment.name.clone(),
                parameters: environment.runtime.clone(),
            })
            .await
            .with_context(|| {
                format!(
                    "Failed to provision runtime for {}/{}",
                    service, environment.name
                )
            })?;

        self.runtimes.write().await.insert(
            (service.to_string(), environment.name.clone()),
            Arc::clone(&runtime),
        );
        Ok(runtime)
    }

    /// Provisions everything a pipeline needs before its first stage
    ///
    /// Creates the service runtime of the pipeline's environment and, in that
    /// environment, a database for every migration whose secret the store
    /// cannot resolve.
    pub async fn provision(
        &self,
        pipeline: &Pipeline,
        secrets: &dyn SecretStore,
    ) -> Result<ServiceRuntimeHandle> {
        let environment = &pipeline.environment().name;
        for action in pipeline.stages().iter().flat_map(|stage| &stage.actions) {
            let ActionSpec::Migrate(migration) = &action.spec else {
                continue;
            };
            let migration = migration.scoped(environment);
            if secrets.resolve(&migration.secret).await.is_err() {
                self.provisioner
                    .create_database(DatabaseConfig {
                        database: migration.database.clone(),
                        secret: migration.secret,
                    })
                    .await
                    .with_context(|| {
                        format!("Failed to provision database {}", migration.database)
                    })?;
            }
        }

        self.get_or_provision(pipeline.service(), pipeline.environment())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::platform::{HealthBehavior, SimulatedPlatform};
    use crate::runtime::{DeployError, DeployOutcome, DeployRequest};
    use convoy_core::domain::environment::BranchResolution;
    use std::time::Duration;

    fn environment(name: &str) -> Environment {
        Environment {
            name: name.to_string(),
            branch: name.to_string(),
            runtime: RuntimeParameters::default(),
            resolution: BranchResolution::Mapped,
        }
    }

    fn registry(secrets: Arc<InMemorySecretStore>) -> RuntimeRegistry {
        RuntimeRegistry::new(Arc::new(LocalProvisioner::new(
            Arc::new(SimulatedPlatform::new()),
            RuntimeSettings::default(),
            AutoscalingSettings::default(),
            secrets,
        )))
    }

    #[tokio::test]
    async fn test_runtime_provisioned_once() {
        let registry = registry(Arc::new(InMemorySecretStore::new()));

        let first = registry.get_or_provision("svc", &environment("dev")).await.unwrap();
        let second = registry.get_or_provision("svc", &environment("dev")).await.unwrap();
        let other = registry.get_or_provision("svc", &environment("prod")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.list().await[0].environment(), "dev");
    }

    #[tokio::test]
    async fn test_create_database_issues_secret_once() {
        let secrets = Arc::new(InMemorySecretStore::new());
        let provisioner = LocalProvisioner::new(
            Arc::new(SimulatedPlatform::new()),
            RuntimeSettings::default(),
            AutoscalingSettings::default(),
            Arc::clone(&secrets),
        )
        .with_database_server("db.internal", 6543);

        let config = DatabaseConfig {
            database: "svc-db".to_string(),
            secret: SecretRef("svc-db-credentials".to_string()),
        };
        let handle = provisioner.create_database(config.clone()).await.unwrap();
        let issued = secrets.resolve(&handle.secret).await.unwrap();
        assert_eq!(issued.host, "db.internal");
        assert_eq!(issued.username, "svc_db");

        provisioner.create_database(config).await.unwrap();
        assert_eq!(secrets.resolve(&handle.secret).await.unwrap(), issued);
    }

    #[tokio::test]
    async fn test_new_runtime_adopts_running_tasks() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.launch("svc", "dev", "registry/svc:old").await.unwrap();
        platform.launch("svc", "prod", "registry/svc:old").await.unwrap();
        let registry = RuntimeRegistry::new(Arc::new(LocalProvisioner::new(
            platform.clone(),
            RuntimeSettings {
                health_poll_interval: Duration::from_millis(1),
                rollback_max_attempts: 3,
                rollback_backoff: Duration::from_millis(1),
            },
            AutoscalingSettings::default(),
            Arc::new(InMemorySecretStore::new()),
        )));

        let runtime = registry.get_or_provision("svc", &environment("dev")).await.unwrap();
        let snapshot = runtime.snapshot().await;
        assert_eq!(snapshot.current_image.as_deref(), Some("registry/svc:old"));
        assert_eq!(snapshot.running_tasks, 1);

        let outcome = runtime
            .deploy(&DeployRequest {
                image: "registry/svc:new".to_string(),
                grace_period: Duration::from_millis(50),
                min_healthy_percent: 100,
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                previous: Some("registry/svc:old".to_string()),
            }
        );

        let dev: Vec<String> = platform
            .list("svc", "dev")
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.image)
            .collect();
        assert_eq!(dev, vec!["registry/svc:new"]);
        assert_eq!(platform.list("svc", "prod").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_adopted_image_is_restored_on_rollback() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.launch("svc", "dev", "registry/svc:old").await.unwrap();
        platform
            .set_behavior("registry/svc:bad", HealthBehavior::Never)
            .await;
        let provisioner = LocalProvisioner::new(
            platform.clone(),
            RuntimeSettings {
                health_poll_interval: Duration::from_millis(1),
                rollback_max_attempts: 3,
                rollback_backoff: Duration::from_millis(1),
            },
            AutoscalingSettings::default(),
            Arc::new(InMemorySecretStore::new()),
        );
        let runtime = provisioner
            .create_runtime(RuntimeConfig {
                service: "svc".to_string(),
                environment: "dev".to_string(),
                parameters: RuntimeParameters::default(),
            })
            .await
            .unwrap();

        let error = runtime
            .deploy(&DeployRequest {
                image: "registry/svc:bad".to_string(),
                grace_period: Duration::from_millis(20),
                min_healthy_percent: 100,
            })
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DeployError::HealthCheckTimeout { restored: Some(ref image), .. }
                if image == "registry/svc:old"
        ));
        assert_eq!(platform.running_images().await, vec!["registry/svc:old"]);
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let registry = registry(Arc::new(InMemorySecretStore::new()));
        let mut env = environment("dev");
        env.runtime.min_capacity = 0;

        assert!(registry.get_or_provision("svc", &env).await.is_err());
        assert!(registry.get("svc", "dev").await.is_none());
    }
}
