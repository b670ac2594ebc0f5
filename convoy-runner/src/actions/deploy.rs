//! Deploy action
//!
//! Consumes an image descriptor and hands it to the service runtime of the
//! run's environment. Rollout, health gating and rollback all happen in the
//! runtime; this action only reports the outcome.

use convoy_core::domain::action::{Action, DeploySpec};
use convoy_core::domain::artifact::ArtifactKind;
use std::time::Duration;

use super::ActionContext;
use crate::error::ActionError;
use crate::runtime::{DeployError, DeployOutcome, DeployRequest};

pub(super) async fn execute(
    ctx: &ActionContext,
    action: &Action,
    spec: &DeploySpec,
) -> Result<(), ActionError> {
    let _slot = ctx.engine.limits.acquire(ctx.pipeline.name(), action).await?;

    let artifact = ctx
        .artifacts
        .get_kind(&spec.image, ArtifactKind::ImageRef)
        .await?;
    let descriptor = artifact
        .as_image()
        .ok_or_else(|| DeployError::NotAnImage(spec.image.to_string()))?;

    let runtime = ctx
        .engine
        .runtimes
        .get_or_provision(&descriptor.service_name, ctx.pipeline.environment())
        .await
        .map_err(|e| DeployError::Provisioning(format!("{:#}", e)))?;

    ctx.run.log_info(
        Some(&action.id),
        format!(
            "Deploying {} to {}/{}",
            descriptor.image_uri,
            runtime.service(),
            runtime.environment()
        ),
    );

    let request = DeployRequest {
        image: descriptor.image_uri.clone(),
        grace_period: Duration::from_secs(spec.grace_period_secs),
        min_healthy_percent: spec.min_healthy_percent,
    };

    match runtime.deploy(&request).await {
        Ok(DeployOutcome::Unchanged) => {
            ctx.run.log_info(
                Some(&action.id),
                format!("{} is already running; nothing to do", descriptor.image_uri),
            );
            Ok(())
        }
        Ok(DeployOutcome::Deployed { previous }) => {
            ctx.run.log_info(
                Some(&action.id),
                format!(
                    "Rolled out {} (previous: {})",
                    descriptor.image_uri,
                    previous.as_deref().unwrap_or("none")
                ),
            );
            Ok(())
        }
        Err(e) => {
            ctx.run.log_error(Some(&action.id), e.to_string());
            Err(e.into())
        }
    }
}
