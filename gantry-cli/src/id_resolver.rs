//! ID resolver module
//!
//! Resolves UUID prefixes to full run or definition IDs by querying the API,
//! so users can type short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use gantry_client::{OrchestratorClient, RunQuery};
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a run ID or prefix to a full UUID
///
/// If the input is already a full UUID, returns it immediately.
/// Otherwise, fetches the run list and finds the one matching the prefix.
pub async fn resolve_run_id(client: &OrchestratorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let runs = client
        .list_runs(&RunQuery::default())
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix("run", id_or_prefix, runs.iter().map(|r| r.id))
}

/// Resolve a definition ID or prefix to a full UUID
pub async fn resolve_definition_id(
    client: &OrchestratorClient,
    id_or_prefix: &IdOrPrefix,
) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let definitions = client
        .list_definitions()
        .await
        .context("Failed to fetch definitions for ID resolution")?;

    match_prefix("definition", id_or_prefix, definitions.iter().map(|d| d.id))
}

/// Pick the single ID starting with the given prefix
fn match_prefix(
    what: &str,
    id_or_prefix: &IdOrPrefix,
    ids: impl Iterator<Item = Uuid>,
) -> Result<Uuid> {
    let prefix = id_or_prefix.as_str().to_lowercase();

    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No {} found with ID starting with '{}'", what, prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(ToString::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple {}s: {}",
                prefix,
                what,
                ids.join(", ")
            ))
        }
    }
}
