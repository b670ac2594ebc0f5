//! Build action
//!
//! Runs the build commands against the checkout, then optionally builds and
//! pushes an image tagged with the input version. Outputs are only published
//! once everything, push included, has succeeded.

use convoy_core::domain::action::{Action, BuildSpec};
use convoy_core::domain::artifact::{Artifact, ArtifactKind, ArtifactPayload, ArtifactRef, ImageDescriptor};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::ActionContext;
use crate::error::{ActionError, BuildError};
use crate::podman::CommandSpec;

/// Version of a build's outputs, derived from the identity of its inputs
///
/// Builds consuming the source are versioned by the source revision.
pub(crate) fn derive_version(inputs: &[Artifact], revision: &str) -> String {
    let mut versions: Vec<&str> = Vec::new();
    for artifact in inputs {
        if !versions.contains(&artifact.version.as_str()) {
            versions.push(&artifact.version);
        }
    }

    if versions.is_empty() {
        revision.to_string()
    } else {
        versions.join("-")
    }
}

pub(super) async fn execute(
    ctx: &ActionContext,
    action: &Action,
    spec: &BuildSpec,
) -> Result<(), ActionError> {
    let _slot = ctx.engine.limits.acquire(ctx.pipeline.name(), action).await?;

    let inputs = ctx.artifacts.resolve_all(&action.inputs).await?;
    let source = ctx.source().await?;
    let checkout = PathBuf::from(&source.path);
    let version = derive_version(&inputs, &ctx.revision);

    if !action.env.commands.is_empty() {
        run_commands(ctx, action, &checkout).await?;
    }

    let image_uri = match &spec.image {
        Some(image) => {
            let tag = format!("{}:{}", image.repository, version);
            build_image(ctx, action, &checkout, &image.context, &image.dockerfile, &tag).await?;
            if image.push {
                ctx.engine
                    .environment
                    .push_image(&tag)
                    .await
                    .map_err(|e| BuildError::Push {
                        image: tag.clone(),
                        reason: format!("{:#}", e),
                    })?;
                ctx.run.log_info(Some(&action.id), format!("Pushed {}", tag));
            }
            Some(tag)
        }
        None => None,
    };

    let stage = stage_of(ctx, action)?;
    let mut outputs = Vec::with_capacity(action.outputs.len());
    for output in &action.outputs {
        let payload = match output.kind {
            ArtifactKind::ImageRef => {
                let image_uri = image_uri.clone().ok_or_else(|| BuildError::MissingSetting {
                    slot: output.slot.clone(),
                    setting: "image",
                })?;
                ArtifactPayload::Image(ImageDescriptor {
                    service_name: ctx.pipeline.service().to_string(),
                    image_uri,
                })
            }
            ArtifactKind::Manifest => {
                let path = spec.manifest_path.as_deref().ok_or_else(|| {
                    BuildError::MissingSetting {
                        slot: output.slot.clone(),
                        setting: "manifest",
                    }
                })?;
                ArtifactPayload::Manifest {
                    document: read_manifest(&checkout, path).await?,
                }
            }
            ArtifactKind::Source => {
                return Err(ActionError::Internal(format!(
                    "build '{}' cannot produce a source artifact",
                    action.id
                )));
            }
        };

        outputs.push(Artifact::new(
            ArtifactRef::new(stage, output.slot.clone()),
            action.id.clone(),
            ctx.run.run_id,
            version.clone(),
            payload,
        ));
    }

    let published = outputs.len();
    ctx.artifacts.publish(outputs).await;
    info!("Build {} published {} artifact(s) at version {}", action.id, published, version);
    ctx.run.log_info(
        Some(&action.id),
        format!("Published {} artifact(s) at version {}", published, version),
    );

    Ok(())
}

/// Name of the stage an action belongs to
fn stage_of<'a>(ctx: &'a ActionContext, action: &Action) -> Result<&'a str, ActionError> {
    ctx.pipeline
        .stages()
        .iter()
        .find(|stage| stage.actions.iter().any(|a| a.id == action.id))
        .map(|stage| stage.name.as_str())
        .ok_or_else(|| ActionError::Internal(format!("action '{}' is not part of the pipeline", action.id)))
}

async fn run_commands(ctx: &ActionContext, action: &Action, checkout: &Path) -> Result<(), BuildError> {
    let command = CommandSpec {
        image: action
            .env
            .container
            .clone()
            .unwrap_or_else(|| ctx.default_image.clone()),
        workdir: checkout.to_path_buf(),
        commands: action.env.commands.clone(),
        env_vars: action.env.env_vars.clone(),
        secret_env: Vec::new(),
    };

    ctx.run.log_info(
        Some(&action.id),
        format!("Running {} command(s) in {}", command.commands.len(), command.image),
    );

    let output = ctx
        .engine
        .environment
        .run(&command)
        .await
        .map_err(|e| BuildError::Environment(format!("{:#}", e)))?;

    ctx.run.log_output(&action.id, &output.stdout);
    ctx.run.log_output(&action.id, &output.stderr);

    if !output.success() {
        ctx.run.log_error(
            Some(&action.id),
            format!("Build commands exited with code {}", output.exit_code),
        );
        return Err(BuildError::CommandsFailed {
            exit_code: output.exit_code,
        });
    }

    debug!("Build commands of {} succeeded", action.id);
    Ok(())
}

async fn build_image(
    ctx: &ActionContext,
    action: &Action,
    checkout: &Path,
    context: &str,
    dockerfile: &str,
    tag: &str,
) -> Result<(), BuildError> {
    ctx.run
        .log_info(Some(&action.id), format!("Building image {}", tag));

    ctx.engine
        .environment
        .build_image(&checkout.join(context), dockerfile, tag)
        .await
        .map_err(|e| BuildError::ImageBuild(format!("{:#}", e)))
}

async fn read_manifest(checkout: &Path, path: &str) -> Result<serde_json::Value, BuildError> {
    let content = tokio::fs::read_to_string(checkout.join(path))
        .await
        .map_err(|e| BuildError::Manifest {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    serde_json::from_str(&content).map_err(|e| BuildError::Manifest {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
