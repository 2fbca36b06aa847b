//! Orchestrator engine
//!
//! Owns every pipeline run. Each run is an explicit [`PipelineRun`] record
//! driven by its own task: stages execute strictly in order, outputs are
//! committed to the artifact store before the next stage starts and the
//! record is persisted after every transition so a restarted orchestrator
//! can pick the run up where it stopped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_core::domain::approval::{ApprovalDecision, Decision, GateId, GateState, RejectionReason};
use gantry_core::domain::artifact::{Artifact, ArtifactRef};
use gantry_core::domain::definition::{PipelineDefinition, SOURCE_ARTIFACT, StageKind, StageSpec};
use gantry_core::domain::run::{PipelineRun, RunStatus, StageStatus, TriggerEvent};
use gantry_core::{ErrorKind, GrantSet, PermissionDenied, ValidationError};

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::executor::StageExecutor;
use crate::gate::{ApprovalGates, GateError};
use crate::store::{RunFilter, RunStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid definition source: {0}")]
    InvalidSource(String),

    #[error("pipeline definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("definition '{definition}' triggers on branch '{expected}', not '{actual}'")]
    BranchMismatch {
        definition: String,
        expected: String,
        actual: String,
    },

    #[error("run {0} has already finished")]
    RunFinished(Uuid),

    #[error("stage '{stage}' of run {run_id} is not an approval gate")]
    NotAGate { run_id: Uuid, stage: String },

    #[error("gate {0} is not awaiting a decision")]
    GateNotOpen(GateId),

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GateError> for EngineError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::PermissionDenied(denied) => EngineError::PermissionDenied(denied),
            GateError::NotOpen(gate) => EngineError::GateNotOpen(gate),
            GateError::Store(e) => EngineError::Store(e),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// In-memory handle of a run whose driver task is alive
struct ActiveRun {
    /// Serializes every transition of this run
    state: tokio::sync::Mutex<PipelineRun>,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
}

struct Inner {
    store: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactStore>,
    gates: ApprovalGates,
    executor: StageExecutor,
    active: Mutex<HashMap<Uuid, Arc<ActiveRun>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        artifacts: Arc<dyn ArtifactStore>,
        executor: StageExecutor,
        approvers: GrantSet,
    ) -> Self {
        let gates = ApprovalGates::new(store.clone(), approvers);
        Self {
            inner: Arc::new(Inner {
                store,
                artifacts,
                gates,
                executor,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate and store a new definition version
    pub async fn register_definition(
        &self,
        definition: PipelineDefinition,
    ) -> EngineResult<PipelineDefinition> {
        gantry_core::validate(&definition)?;
        let stored = self.inner.store.insert_definition(definition).await?;

        info!(
            "Registered definition {} v{} ({} stages)",
            stored.name,
            stored.version,
            stored.stages.len()
        );
        Ok(stored)
    }

    /// Compile Lua definition source, then register it
    pub async fn register_source(&self, source: &str) -> EngineResult<PipelineDefinition> {
        let definition = gantry_lua::compile_definition(source).map_err(|e| {
            match e.downcast_ref::<ValidationError>() {
                Some(invalid) => EngineError::Validation(invalid.clone()),
                None => EngineError::InvalidSource(format!("{:#}", e)),
            }
        })?;
        self.register_definition(definition).await
    }

    pub async fn list_definitions(&self) -> EngineResult<Vec<PipelineDefinition>> {
        Ok(self.inner.store.list_definitions().await?)
    }

    pub async fn get_definition(&self, id: Uuid) -> EngineResult<PipelineDefinition> {
        self.inner
            .store
            .get_definition(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    /// Start a run of the latest version of `definition`
    pub async fn trigger(&self, definition: &str, event: TriggerEvent) -> EngineResult<PipelineRun> {
        let definition = self
            .inner
            .store
            .latest_definition(definition)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition.to_string()))?;

        if event.branch != definition.trigger.branch {
            return Err(EngineError::BranchMismatch {
                definition: definition.name,
                expected: definition.trigger.branch,
                actual: event.branch,
            });
        }

        let mut run = PipelineRun::new(definition, event);
        let source = self
            .inner
            .artifacts
            .put(
                run.id,
                SOURCE_ARTIFACT,
                SOURCE_ARTIFACT,
                run.trigger.source_ref.clone().into_bytes(),
            )
            .await?;
        run.bind_artifact(source);

        self.inner.store.save_run(&run).await?;
        info!(
            run_id = %run.id,
            "Triggered {} v{} on {}",
            run.definition.name,
            run.definition.version,
            run.trigger.branch
        );

        self.spawn(run.clone())?;
        Ok(run)
    }

    /// Restart the driver of every unfinished persisted run
    pub async fn resume(&self) -> EngineResult<usize> {
        let runs = self.inner.store.list_unfinished_runs().await?;
        let mut resumed = 0;

        for run in runs {
            if self.active(run.id)?.is_some() {
                continue;
            }
            info!(
                run_id = %run.id,
                "Resuming {} at stage {}",
                run.definition.name,
                run.current_stage
            );
            self.spawn(run)?;
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Cancel a run that has not finished yet.
    ///
    /// The executing stage is told to stop and a pending gate wait is woken;
    /// artifacts committed so far are kept.
    pub async fn cancel(&self, run_id: Uuid) -> EngineResult<PipelineRun> {
        if let Some(active) = self.active(run_id)? {
            let snapshot = {
                let mut run = active.state.lock().await;
                if !run.cancel() {
                    return Err(EngineError::RunFinished(run_id));
                }
                self.persist(&active, &run).await?;
                run.clone()
            };
            active.cancel.cancel();

            info!(run_id = %run_id, "Run cancelled");
            return Ok(snapshot);
        }

        let mut run = self
            .inner
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if !run.cancel() {
            return Err(EngineError::RunFinished(run_id));
        }
        self.inner.store.save_run(&run).await?;

        info!(run_id = %run_id, "Run cancelled");
        Ok(run)
    }

    /// Decide the gate guarding approval stage `stage` of a run
    pub async fn decide(
        &self,
        run_id: Uuid,
        stage: &str,
        decision: Decision,
        actor: &str,
        comment: Option<String>,
    ) -> EngineResult<ApprovalDecision> {
        let run = self.get_run(run_id).await?;
        let spec = run
            .definition
            .stage(stage)
            .filter(|spec| spec.kind == StageKind::Approval)
            .ok_or_else(|| EngineError::NotAGate {
                run_id,
                stage: stage.to_string(),
            })?;

        let gate = GateId::new(run_id, stage);
        let decided = self
            .inner
            .gates
            .decide(&gate, spec, decision, actor, comment)
            .await;

        if let Err(GateError::PermissionDenied(denied)) = &decided {
            warn!(run_id = %run_id, stage, "Rejected gate decision: {}", denied);
        }
        Ok(decided?)
    }

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<PipelineRun> {
        if let Some(active) = self.active(run_id)? {
            return Ok(active.state.lock().await.clone());
        }

        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> EngineResult<Vec<PipelineRun>> {
        Ok(self.inner.store.list_runs(filter).await?)
    }

    pub async fn list_artifacts(&self, run_id: Uuid) -> EngineResult<Vec<Artifact>> {
        self.get_run(run_id).await?;
        Ok(self.inner.artifacts.list(run_id).await?)
    }

    /// Metadata and full content of one committed artifact
    pub async fn get_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        name: &str,
    ) -> EngineResult<(Artifact, Vec<u8>)> {
        let reference = ArtifactRef::new(run_id, stage, name);
        let metadata = self.inner.artifacts.metadata(&reference).await?;
        let content = self.inner.artifacts.get(&reference).await?;
        Ok((metadata, content))
    }

    /// Wait for a run to reach a terminal state
    pub async fn wait(&self, run_id: Uuid) -> EngineResult<PipelineRun> {
        self.wait_until(run_id, |status| status.is_terminal()).await
    }

    /// Wait until the run's status satisfies `predicate`, or it finishes
    pub async fn wait_until(
        &self,
        run_id: Uuid,
        predicate: impl Fn(RunStatus) -> bool,
    ) -> EngineResult<PipelineRun> {
        if let Some(active) = self.active(run_id)? {
            let mut status = active.status.subscribe();
            drop(active);
            // The sender goes away once the driver exits
            let _ = status
                .wait_for(|status| predicate(*status) || status.is_terminal())
                .await;
        }
        self.get_run(run_id).await
    }

    /// Number of runs with a live driver task
    pub fn active_runs(&self) -> usize {
        self.inner.active.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    fn active(&self, run_id: Uuid) -> EngineResult<Option<Arc<ActiveRun>>> {
        let active = self
            .inner
            .active
            .lock()
            .map_err(|_| StoreError::poisoned())?;
        Ok(active.get(&run_id).cloned())
    }

    fn spawn(&self, run: PipelineRun) -> EngineResult<()> {
        let run_id = run.id;
        let handle = Arc::new(ActiveRun {
            status: watch::Sender::new(run.status),
            state: tokio::sync::Mutex::new(run),
            cancel: CancellationToken::new(),
        });

        self.inner
            .active
            .lock()
            .map_err(|_| StoreError::poisoned())?
            .insert(run_id, handle.clone());

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run_id, handle).await;
        });
        Ok(())
    }

    async fn persist(&self, active: &ActiveRun, run: &PipelineRun) -> EngineResult<()> {
        self.inner.store.save_run(run).await?;
        active.status.send_replace(run.status);
        Ok(())
    }

    /// Driver task of one run
    async fn drive(&self, run_id: Uuid, active: Arc<ActiveRun>) {
        let definition = active.state.lock().await.definition.clone();

        loop {
            let index = {
                let run = active.state.lock().await;
                if run.is_terminal() {
                    break;
                }
                run.current_stage
            };

            let Some(stage) = definition.stages.get(index) else {
                error!(run_id = %run_id, "Stage index {} out of range", index);
                break;
            };

            let step = match stage.kind {
                StageKind::Approval => self.run_gate(&active, index, stage).await,
                StageKind::Build | StageKind::Deploy => {
                    self.run_stage(&active, &definition, index, stage).await
                }
            };

            if let Err(e) = step {
                // The run stays unfinished in the store and resumes on restart
                error!(run_id = %run_id, stage = %stage.name, "Run driver stopped: {}", e);
                break;
            }
        }

        if let Ok(mut runs) = self.inner.active.lock() {
            runs.remove(&run_id);
        }

        let run = active.state.lock().await;
        match &run.failure {
            Some(failure) if run.is_terminal() => info!(
                run_id = %run_id,
                "Run {}: {} at stage '{}': {}",
                run.status,
                failure.kind,
                failure.stage,
                failure.message
            ),
            _ => info!(run_id = %run_id, "Run {}", run.status),
        }
    }

    async fn run_stage(
        &self,
        active: &ActiveRun,
        definition: &PipelineDefinition,
        index: usize,
        stage: &StageSpec,
    ) -> EngineResult<()> {
        let (run_id, inputs) = {
            let mut run = active.state.lock().await;
            if run.is_terminal() {
                return Ok(());
            }

            if run.stages[index].status == StageStatus::Running
                && self.recover_interrupted(&mut run, index, stage).await?
            {
                return self.persist(active, &run).await;
            }

            let inputs = match self.resolve_inputs(&run, stage).await {
                Ok(inputs) => inputs,
                Err((kind, message)) => {
                    run.fail_stage(index, kind, message);
                    return self.persist(active, &run).await;
                }
            };

            run.start_stage(index);
            self.persist(active, &run).await?;
            (run.id, inputs)
        };

        info!(run_id = %run_id, stage = %stage.name, "Stage started");

        let report = self
            .inner
            .executor
            .execute(definition, stage, run_id, inputs, &active.cancel)
            .await;

        let mut run = active.state.lock().await;
        run.record_attempts(index, report.attempts, report.logs);

        if run.is_terminal() {
            return self.persist(active, &run).await;
        }

        match report.result {
            Ok(outputs) => match self.commit_outputs(run_id, stage, outputs).await {
                Ok(refs) => {
                    info!(run_id = %run_id, stage = %stage.name, "Stage succeeded");
                    run.complete_stage(index, refs);
                }
                Err((kind, message)) => run.fail_stage(index, kind, message),
            },
            Err(e) => {
                warn!(run_id = %run_id, stage = %stage.name, "Stage failed: {}", e);
                run.fail_stage(index, e.kind(), e.to_string());
            }
        }

        self.persist(active, &run).await
    }

    /// Settle a stage that was executing when the orchestrator stopped.
    ///
    /// Returns `true` if the stage was settled here and must not be
    /// dispatched again.
    async fn recover_interrupted(
        &self,
        run: &mut PipelineRun,
        index: usize,
        stage: &StageSpec,
    ) -> EngineResult<bool> {
        if stage.outputs.is_empty() {
            return Ok(false);
        }

        let mut committed = Vec::new();
        for output in &stage.outputs {
            let reference = ArtifactRef::new(run.id, &stage.name, output);
            if self.inner.artifacts.contains(&reference).await? {
                committed.push(reference);
            }
        }

        if committed.is_empty() {
            debug!(run_id = %run.id, stage = %stage.name, "Re-dispatching interrupted stage");
            return Ok(false);
        }

        if committed.len() == stage.outputs.len() {
            info!(run_id = %run.id, stage = %stage.name, "Interrupted stage had committed all outputs");
            run.complete_stage(index, committed);
        } else {
            run.fail_stage(
                index,
                ErrorKind::ContractViolation,
                format!(
                    "stage was interrupted after committing {} of {} outputs",
                    committed.len(),
                    stage.outputs.len()
                ),
            );
        }
        Ok(true)
    }

    async fn resolve_inputs(
        &self,
        run: &PipelineRun,
        stage: &StageSpec,
    ) -> Result<BTreeMap<String, Vec<u8>>, (ErrorKind, String)> {
        let mut inputs = BTreeMap::new();

        for name in &stage.inputs {
            let Some(reference) = run.artifact(name) else {
                return Err((
                    ErrorKind::UnresolvedArtifact,
                    format!("input '{}' is not bound in this run", name),
                ));
            };

            let content = match self.inner.artifacts.get(reference).await {
                Ok(content) => content,
                Err(e) => {
                    let kind = e.kind().unwrap_or(ErrorKind::ExecutorTransientFailure);
                    return Err((kind, format!("cannot resolve input '{}': {}", name, e)));
                }
            };
            inputs.insert(name.clone(), content);
        }

        Ok(inputs)
    }

    /// Store every output, in declaration order
    async fn commit_outputs(
        &self,
        run_id: Uuid,
        stage: &StageSpec,
        mut outputs: BTreeMap<String, Vec<u8>>,
    ) -> Result<Vec<ArtifactRef>, (ErrorKind, String)> {
        let mut refs = Vec::with_capacity(stage.outputs.len());

        for name in &stage.outputs {
            let content = outputs.remove(name).unwrap_or_default();
            match self
                .inner
                .artifacts
                .put(run_id, &stage.name, name, content)
                .await
            {
                Ok(reference) => refs.push(reference),
                Err(e) => {
                    let kind = e.kind().unwrap_or(ErrorKind::ExecutorTransientFailure);
                    return Err((kind, format!("cannot commit output '{}': {}", name, e)));
                }
            }
        }

        Ok(refs)
    }

    async fn run_gate(&self, active: &ActiveRun, index: usize, stage: &StageSpec) -> EngineResult<()> {
        let handle = {
            let mut run = active.state.lock().await;
            if run.is_terminal() {
                return Ok(());
            }

            run.await_approval(index);
            let opened_at = run.stages[index].started_at.unwrap_or(run.updated_at);
            let window = run.definition.approval_timeout(stage);
            let handle = self
                .inner
                .gates
                .open(GateId::new(run.id, &stage.name), window, opened_at)
                .await?;

            self.persist(active, &run).await?;
            handle
        };

        info!(gate = %handle.id(), "Awaiting approval");
        let decision = self.inner.gates.wait(&handle, &active.cancel).await;
        self.inner.gates.close(handle.id());

        // Cancelled; the canceller already recorded the run's new state
        let Some(decision) = decision else {
            return Ok(());
        };

        let mut run = active.state.lock().await;
        if run.is_terminal() {
            return Ok(());
        }

        match decision.state() {
            GateState::Approved => {
                info!(gate = %handle.id(), "Approved by {}", decision.actor);
                run.complete_stage(index, Vec::new());
            }
            GateState::Rejected(RejectionReason::Decision) => {
                let mut message = format!("rejected by {}", decision.actor);
                if let Some(comment) = &decision.comment {
                    message.push_str(": ");
                    message.push_str(comment);
                }
                run.fail_stage(index, ErrorKind::ApprovalRejected, message);
            }
            GateState::Rejected(RejectionReason::Expired) => {
                run.fail_stage(index, ErrorKind::ApprovalExpired, "approval window expired");
            }
            GateState::Pending => return Ok(()),
        }

        self.persist(active, &run).await
    }
}
