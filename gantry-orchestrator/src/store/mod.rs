//! Run state persistence
//!
//! Definitions, runs and approval decisions are persisted through the
//! [`RunStore`] trait. PostgreSQL is the durable backend; an in-memory
//! implementation backs tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use gantry_core::domain::approval::{ApprovalDecision, GateId};
use gantry_core::domain::definition::PipelineDefinition;
use gantry_core::domain::run::{PipelineRun, RunStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        StoreError::Internal("lock poisoned".to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter criteria for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub definition: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

impl RunFilter {
    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, run: &PipelineRun) -> bool {
        self.definition
            .as_ref()
            .is_none_or(|name| &run.definition.name == name)
            && self.status.is_none_or(|status| run.status == status)
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Store a new definition version.
    ///
    /// The version number is assigned here (one past the latest version of
    /// the same name) and the stored definition is returned.
    async fn insert_definition(&self, definition: PipelineDefinition)
    -> StoreResult<PipelineDefinition>;

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<PipelineDefinition>>;

    /// Latest version registered under `name`
    async fn latest_definition(&self, name: &str) -> StoreResult<Option<PipelineDefinition>>;

    /// Every stored version, newest first
    async fn list_definitions(&self) -> StoreResult<Vec<PipelineDefinition>>;

    /// Insert or replace a run record
    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()>;

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<PipelineRun>>;

    /// Runs matching `filter`, newest first
    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>>;

    /// Runs that have not reached a terminal state, oldest first
    async fn list_unfinished_runs(&self) -> StoreResult<Vec<PipelineRun>>;

    /// Terminal, not yet retired runs that finished before `cutoff`
    async fn list_retirable_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>>;

    /// Record a gate decision; the first one recorded wins.
    ///
    /// Returns whichever decision is stored after the call, so a losing
    /// writer learns the original decision.
    async fn record_decision(&self, decision: &ApprovalDecision) -> StoreResult<ApprovalDecision>;

    async fn get_decision(&self, gate: &GateId) -> StoreResult<Option<ApprovalDecision>>;
}

fn next_version(latest: Option<u32>) -> u32 {
    latest.map_or(1, |v| v + 1)
}
