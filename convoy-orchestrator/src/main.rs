//! Convoy Orchestrator
//!
//! HTTP service that registers pipelines, queues and executes runs, and hosts
//! the service runtimes those runs deploy into.
//!
//! Architecture:
//! - API: axum handlers, one module per resource
//! - Services: business logic between handlers and repositories
//! - Repositories: PostgreSQL access (sqlx)
//! - Scheduler: claims queued runs and executes them on the engine

use anyhow::{Context, Result};
use convoy_runner::runtime::{LocalProvisioner, PodmanTaskPlatform, RuntimeRegistry};
use convoy_runner::{
    ChainedSecretStore, Engine, EnvSecretStore, GitSource, InMemorySecretStore, PodmanEnvironment,
    SecretStore, check_podman_available,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod lock;
pub mod repository;
pub mod scheduler;
pub mod service;

use crate::config::OrchestratorConfig;
use crate::lock::PgAdvisoryMigrationLock;
use crate::scheduler::{RunCancellations, RunScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Convoy Orchestrator...");

    let config = OrchestratorConfig::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if let Err(e) = check_podman_available().await {
        tracing::warn!("Podman is not usable; runs will fail: {:#}", e);
    }

    tracing::info!("Connecting to database...");

    // Create database connection pool
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    // Run migrations
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let orphaned = db::fail_orphaned_runs(&pool)
        .await
        .context("Failed to recover interrupted runs")?;
    if orphaned > 0 {
        tracing::warn!("Marked {} interrupted run(s) as failed", orphaned);
    }

    // Credentials of provisioned databases live in memory; operator-managed
    // ones come from the environment and take precedence
    let provisioned = Arc::new(InMemorySecretStore::new());
    let secrets: Arc<dyn SecretStore> = Arc::new(ChainedSecretStore::new(vec![
        Arc::new(EnvSecretStore::new()),
        Arc::clone(&provisioned) as Arc<dyn SecretStore>,
    ]));

    let (db_host, db_port) = config.database_server.clone();
    let provisioner = LocalProvisioner::new(
        Arc::new(PodmanTaskPlatform::new()),
        config.runner.runtime_settings(),
        config.runner.autoscaling_settings(),
        provisioned,
    )
    .with_database_server(db_host, db_port);
    let runtimes = Arc::new(RuntimeRegistry::new(Arc::new(provisioner)));

    let engine = Engine::new(
        Arc::new(GitSource::new()),
        Arc::new(PodmanEnvironment::new()),
        Arc::new(PgAdvisoryMigrationLock::new(pool.clone())),
        secrets,
        Arc::clone(&runtimes),
    );

    let cancellations = Arc::new(RunCancellations::new());
    let scheduler = Arc::new(RunScheduler::new(
        config.clone(),
        pool.clone(),
        engine,
        Arc::clone(&cancellations),
    ));
    tokio::spawn(scheduler.run());

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        pool,
        runtimes,
        cancellations,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
