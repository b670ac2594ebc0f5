//! Migration action
//!
//! Holds the database's migration lock for exactly as long as the migration
//! commands run. Database and secret are scoped to the run's environment, so
//! dev and prod never share a lock or credentials. Credentials are resolved
//! from the secret store at the last moment and only ever travel as container
//! environment.

use convoy_core::domain::action::{Action, MigrationSpec};
use std::path::PathBuf;
use tracing::{info, warn};

use super::ActionContext;
use crate::error::{ActionError, MigrationError};
use crate::podman::CommandSpec;

pub(super) async fn execute(
    ctx: &ActionContext,
    action: &Action,
    spec: &MigrationSpec,
) -> Result<(), ActionError> {
    let spec = &spec.scoped(&ctx.pipeline.environment().name);
    let holder = format!("run {} ({})", ctx.run.run_id, action.id);
    let lease = ctx
        .engine
        .migration_lock
        .try_acquire(&spec.database, &holder)
        .await
        .map_err(MigrationError::from)
        .inspect_err(|e| ctx.run.log_error(Some(&action.id), e.to_string()))?;

    ctx.run.log_info(
        Some(&action.id),
        format!("Acquired migration lock for {}", spec.database),
    );

    let result = migrate(ctx, action, spec).await;

    if let Err(e) = lease.release().await {
        warn!(
            "Failed to release migration lock for {}: {:#}",
            spec.database, e
        );
    }

    result
}

async fn migrate(
    ctx: &ActionContext,
    action: &Action,
    spec: &MigrationSpec,
) -> Result<(), ActionError> {
    ctx.artifacts.resolve_all(&action.inputs).await?;
    let source = ctx.source().await?;

    let credentials = ctx
        .engine
        .secrets
        .resolve(&spec.secret)
        .await
        .map_err(MigrationError::from)?;

    let command = CommandSpec {
        image: action
            .env
            .container
            .clone()
            .unwrap_or_else(|| ctx.default_image.clone()),
        workdir: PathBuf::from(&source.path),
        commands: action.env.commands.clone(),
        env_vars: action.env.env_vars.clone(),
        secret_env: credentials.to_env(),
    };

    info!("Migrating {} with {}", spec.database, spec.secret);
    ctx.run.log_info(
        Some(&action.id),
        format!("Migrating {} using {}", spec.database, spec.secret),
    );

    let output = ctx
        .engine
        .environment
        .run(&command)
        .await
        .map_err(|e| MigrationError::Environment(format!("{:#}", e)))?;

    ctx.run.log_output(&action.id, &output.stdout);
    ctx.run.log_output(&action.id, &output.stderr);

    if !output.success() {
        return Err(MigrationError::CommandsFailed {
            database: spec.database.clone(),
            exit_code: output.exit_code,
        }
        .into());
    }

    ctx.run
        .log_info(Some(&action.id), format!("Migrated {}", spec.database));
    Ok(())
}
