//! Run DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{PipelineRun, RunFailure, RunStatus};

/// Source-change event posted to start a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRun {
    /// Definition name; the latest version is used
    pub definition: String,
    pub branch: String,
    #[serde(default)]
    pub revision: Option<String>,
    pub source_ref: String,
}

/// Compact view of a run for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub definition: String,
    pub version: u32,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub failure: Option<RunFailure>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id,
            definition: run.definition.name.clone(),
            version: run.definition.version,
            status: run.status,
            current_stage: run.stages.get(run.current_stage).map(|s| s.name.clone()),
            failure: run.failure.clone(),
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}
