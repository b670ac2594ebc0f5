//! ID resolver module
//!
//! Resolves UUID prefixes to full UUIDs by querying the API, so users can
//! type short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use convoy_client::OrchestratorClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a pipeline ID or prefix to a full UUID
///
/// Full UUIDs are returned without a request; prefixes are matched against
/// every registered pipeline.
pub async fn resolve_pipeline_id(
    client: &OrchestratorClient,
    id_or_prefix: &IdOrPrefix,
) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let pipelines = client
        .list_pipelines()
        .await
        .context("Failed to fetch pipelines for ID resolution")?;

    resolve_unique("pipeline", id_or_prefix, pipelines.iter().map(|p| p.id))
}

/// Resolve a run ID or prefix to a full UUID
pub async fn resolve_run_id(client: &OrchestratorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let runs = client
        .list_runs(None)
        .await
        .context("Failed to fetch runs for ID resolution")?;

    resolve_unique("run", id_or_prefix, runs.iter().map(|r| r.id))
}

/// Picks the single ID matching the prefix
///
/// # Errors
/// Returns an error if no ID or more than one ID matches
fn resolve_unique(
    kind: &str,
    id_or_prefix: &IdOrPrefix,
    ids: impl Iterator<Item = Uuid>,
) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids.filter(|id| id_or_prefix.matches(id)).collect();

    match matches.as_slice() {
        [] => Err(anyhow!(
            "No {} found with ID starting with '{}'",
            kind,
            id_or_prefix
        )),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple {}s: {}",
                id_or_prefix,
                kind,
                ids.join(", ")
            ))
        }
    }
}
