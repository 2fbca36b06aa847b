//! Health Check API Handler

use axum::{Json, extract::State};
use serde::Serialize;

use crate::engine::Orchestrator;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub active_runs: usize,
}

/// GET /health
pub async fn health_check(State(orchestrator): State<Orchestrator>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_runs: orchestrator.active_runs(),
    })
}
