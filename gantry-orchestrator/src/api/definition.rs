//! Definition API Handlers
//!
//! HTTP endpoints for registering and browsing pipeline definitions.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use gantry_core::domain::definition::PipelineDefinition;
use gantry_core::dto::definition::{DefinitionSummary, RegisterDefinition};

use crate::api::error::ApiResult;
use crate::engine::Orchestrator;

/// POST /api/definitions
/// Compile Lua source and register it as a new definition version
pub async fn register_definition(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<RegisterDefinition>,
) -> ApiResult<(StatusCode, Json<PipelineDefinition>)> {
    tracing::debug!("Registering definition ({} bytes of source)", req.source.len());

    let definition = orchestrator.register_source(&req.source).await?;

    Ok((StatusCode::CREATED, Json(definition)))
}

/// GET /api/definitions
pub async fn list_definitions(
    State(orchestrator): State<Orchestrator>,
) -> ApiResult<Json<Vec<DefinitionSummary>>> {
    let definitions = orchestrator.list_definitions().await?;
    Ok(Json(definitions.iter().map(Into::into).collect()))
}

/// GET /api/definitions/{id}
pub async fn get_definition(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineDefinition>> {
    tracing::debug!("Getting definition: {}", id);

    Ok(Json(orchestrator.get_definition(id).await?))
}
