//! Approval API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use uuid::Uuid;

use gantry_core::domain::approval::ApprovalDecision;
use gantry_core::dto::approval::DecideRequest;

use crate::api::error::ApiResult;
use crate::engine::Orchestrator;

/// POST /api/runs/{id}/gates/{stage}/decision
///
/// Deciding an already decided gate returns the original decision.
pub async fn decide_gate(
    State(orchestrator): State<Orchestrator>,
    Path((id, stage)): Path<(Uuid, String)>,
    Json(req): Json<DecideRequest>,
) -> ApiResult<Json<ApprovalDecision>> {
    tracing::info!(
        "Decision {:?} on gate {}/{} by {}",
        req.decision,
        id,
        stage,
        req.actor
    );

    let decision = orchestrator
        .decide(id, &stage, req.decision, &req.actor, req.comment)
        .await?;

    Ok(Json(decision))
}
