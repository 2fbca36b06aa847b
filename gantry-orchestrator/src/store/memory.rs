//! In-memory run store for tests and local development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use gantry_core::domain::approval::{ApprovalDecision, GateId};
use gantry_core::domain::definition::PipelineDefinition;
use gantry_core::domain::run::PipelineRun;

use super::{RunFilter, RunStore, StoreError, StoreResult, next_version};

/// In-memory run store.
///
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<Uuid, PipelineDefinition>>,
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    decisions: RwLock<HashMap<GateId, ApprovalDecision>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_definition(
        &self,
        mut definition: PipelineDefinition,
    ) -> StoreResult<PipelineDefinition> {
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| StoreError::poisoned())?;

        let latest = definitions
            .values()
            .filter(|d| d.name == definition.name)
            .map(|d| d.version)
            .max();

        definition.id = Uuid::new_v4();
        definition.version = next_version(latest);
        definition.created_at = Utc::now();

        definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<PipelineDefinition>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| StoreError::poisoned())?;
        Ok(definitions.get(&id).cloned())
    }

    async fn latest_definition(&self, name: &str) -> StoreResult<Option<PipelineDefinition>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| StoreError::poisoned())?;
        Ok(definitions
            .values()
            .filter(|d| d.name == name)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> StoreResult<Vec<PipelineDefinition>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| StoreError::poisoned())?;

        let mut list: Vec<_> = definitions.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()> {
        let mut runs = self.runs.write().map_err(|_| StoreError::poisoned())?;
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<PipelineRun>> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;
        Ok(runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;

        let mut list: Vec<_> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            list.truncate(limit as usize);
        }
        Ok(list)
    }

    async fn list_unfinished_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;

        let mut list: Vec<_> = runs.values().filter(|r| !r.is_terminal()).cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn list_retirable_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;

        Ok(runs
            .values()
            .filter(|r| r.is_terminal() && !r.retired)
            .filter(|r| r.finished_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn record_decision(&self, decision: &ApprovalDecision) -> StoreResult<ApprovalDecision> {
        let mut decisions = self.decisions.write().map_err(|_| StoreError::poisoned())?;
        Ok(decisions
            .entry(decision.gate.clone())
            .or_insert_with(|| decision.clone())
            .clone())
    }

    async fn get_decision(&self, gate: &GateId) -> StoreResult<Option<ApprovalDecision>> {
        let decisions = self.decisions.read().map_err(|_| StoreError::poisoned())?;
        Ok(decisions.get(gate).cloned())
    }
}
