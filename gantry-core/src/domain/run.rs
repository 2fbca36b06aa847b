//! Pipeline run domain types
//!
//! A run is an explicit state record owned by the orchestrator. Every
//! transition goes through a method here so the per-stage records, the
//! failure record and the run status never disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::definition::{PipelineDefinition, StageKind};
use super::log::LogEntry;
use crate::error::ErrorKind;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::Cancelled
                | StageStatus::Skipped
        )
    }
}

/// Source-change event that started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub branch: String,
    pub revision: Option<String>,
    /// Reference to the source snapshot bound as the `source` artifact
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Status record of one stage within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<StageError>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage_index: usize,
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Pipeline run record
///
/// Carries a full snapshot of the definition version it was started from, so
/// later registrations never affect a run in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub definition: PipelineDefinition,
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub current_stage: usize,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactRef>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the retention sweeper has purged the run's artifacts
    #[serde(default)]
    pub retired: bool,
}

impl PipelineRun {
    pub fn new(definition: PipelineDefinition, trigger: TriggerEvent) -> Self {
        let now = Utc::now();
        let stages = definition
            .stages
            .iter()
            .map(|spec| StageRecord {
                name: spec.name.clone(),
                kind: spec.kind,
                status: StageStatus::Pending,
                attempts: 0,
                started_at: None,
                finished_at: None,
                error: None,
                logs: Vec::new(),
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            definition,
            trigger,
            status: RunStatus::Running,
            current_stage: 0,
            stages,
            artifacts: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            retired: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn bind_artifact(&mut self, reference: ArtifactRef) {
        if !self.artifacts.contains(&reference) {
            self.artifacts.push(reference);
        }
        self.touch();
    }

    /// Artifact bound under `name`, if any stage of this run produced it
    pub fn artifact(&self, name: &str) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn start_stage(&mut self, index: usize) {
        self.current_stage = index;
        self.status = RunStatus::Running;
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Running;
            record.started_at.get_or_insert_with(Utc::now);
        }
        self.touch();
    }

    pub fn await_approval(&mut self, index: usize) {
        self.current_stage = index;
        self.status = RunStatus::AwaitingApproval;
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::AwaitingApproval;
            record.started_at.get_or_insert_with(Utc::now);
        }
        self.touch();
    }

    pub fn record_attempts(&mut self, index: usize, attempts: u32, logs: Vec<LogEntry>) {
        if let Some(record) = self.stages.get_mut(index) {
            record.attempts = attempts;
            record.logs.extend(logs);
        }
        self.touch();
    }

    /// Mark `index` succeeded, bind its outputs and advance.
    ///
    /// Completing the last stage completes the run.
    pub fn complete_stage(&mut self, index: usize, outputs: Vec<ArtifactRef>) {
        let now = Utc::now();
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Succeeded;
            record.finished_at = Some(now);
        }
        for output in outputs {
            self.bind_artifact(output);
        }

        self.current_stage = index + 1;
        if self.current_stage >= self.stages.len() {
            self.status = RunStatus::Succeeded;
            self.finished_at = Some(now);
        } else {
            self.status = RunStatus::Running;
        }
        self.touch();
    }

    /// Fail the run at `index`; every later stage is skipped
    pub fn fail_stage(&mut self, index: usize, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();

        let stage = match self.stages.get_mut(index) {
            Some(record) => {
                record.status = StageStatus::Failed;
                record.finished_at = Some(now);
                record.error = Some(StageError {
                    kind,
                    message: message.clone(),
                });
                record.name.clone()
            }
            None => String::new(),
        };
        self.skip_after(index);

        self.current_stage = index;
        self.failure = Some(RunFailure {
            stage_index: index,
            stage,
            kind,
            message,
        });
        self.status = RunStatus::Failed;
        self.finished_at = Some(now);
        self.touch();
    }

    /// Cancel the run. Returns `false` if it had already finished.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }

        let now = Utc::now();
        let index = self.current_stage;
        let mut stage = String::new();
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Cancelled;
            record.finished_at = Some(now);
            record.error = Some(StageError {
                kind: ErrorKind::Cancelled,
                message: "run cancelled".to_string(),
            });
            stage = record.name.clone();
        }
        self.skip_after(index);

        self.failure = Some(RunFailure {
            stage_index: index,
            stage,
            kind: ErrorKind::Cancelled,
            message: "run cancelled".to_string(),
        });
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(now);
        self.touch();
        true
    }

    fn skip_after(&mut self, index: usize) {
        for record in self.stages.iter_mut().skip(index + 1) {
            if !record.status.is_finished() {
                record.status = StageStatus::Skipped;
            }
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
