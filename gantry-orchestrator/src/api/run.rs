//! Run API Handlers
//!
//! HTTP endpoints for triggering, inspecting and cancelling runs and for
//! reading their artifacts.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderName, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use gantry_core::domain::artifact::Artifact;
use gantry_core::domain::run::{PipelineRun, RunStatus, TriggerEvent};
use gantry_core::dto::run::{RunSummary, TriggerRun};

use crate::api::error::{ApiError, ApiResult};
use crate::engine::Orchestrator;
use crate::store::RunFilter;

/// Response header carrying an artifact's sha256 digest
pub const DIGEST_HEADER: HeaderName = HeaderName::from_static("x-artifact-digest");

/// POST /api/trigger
/// Start a run of the latest version of a definition
pub async fn trigger_run(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<TriggerRun>,
) -> ApiResult<(StatusCode, Json<PipelineRun>)> {
    tracing::info!("Trigger for {} on branch {}", req.definition, req.branch);

    let event = TriggerEvent {
        branch: req.branch,
        revision: req.revision,
        source_ref: req.source_ref,
    };
    let run = orchestrator.trigger(&req.definition, event).await?;

    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub definition: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// GET /api/runs
pub async fn list_runs(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let mut filter = RunFilter::default();
    if let Some(definition) = query.definition {
        filter = filter.with_definition(definition);
    }
    if let Some(status) = query.status {
        let status: RunStatus = status.parse().map_err(ApiError::BadRequest)?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }

    let runs = orchestrator.list_runs(&filter).await?;
    Ok(Json(runs.iter().map(Into::into).collect()))
}

/// GET /api/runs/{id}
/// Run status with per-stage records and artifact bindings
pub async fn get_run(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(orchestrator.get_run(id).await?))
}

/// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::info!("Cancelling run: {}", id);

    Ok(Json(orchestrator.cancel(id).await?))
}

/// GET /api/runs/{id}/artifacts
pub async fn list_artifacts(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Artifact>>> {
    Ok(Json(orchestrator.list_artifacts(id).await?))
}

/// GET /api/runs/{id}/artifacts/{stage}/{name}
/// Raw artifact content
pub async fn download_artifact(
    State(orchestrator): State<Orchestrator>,
    Path((id, stage, name)): Path<(Uuid, String, String)>,
) -> ApiResult<impl IntoResponse> {
    tracing::debug!("Downloading artifact {}/{}/{}", id, stage, name);

    let (artifact, content) = orchestrator.get_artifact(id, &stage, &name).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DIGEST_HEADER, artifact.digest),
        ],
        content,
    ))
}
