//! End-to-end run scenarios against the in-memory stores and a scripted
//! execution environment.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::domain::approval::{ApprovalDecision, Decision, GateId};
use gantry_core::domain::artifact::ArtifactRef;
use gantry_core::domain::definition::{PipelineDefinition, SOURCE_ARTIFACT, StageSpec};
use gantry_core::domain::permission::{APPROVAL_ACTION, PermissionGrant};
use gantry_core::domain::run::{PipelineRun, RunStatus, StageStatus, TriggerEvent};
use gantry_core::{ErrorKind, GrantSet};

use gantry_orchestrator::artifact::{ArtifactStore, MemoryArtifactStore};
use gantry_orchestrator::executor::{
    EnvironmentError, ExecutionEnvironment, ExecutionOutcome, ExecutionRequest, RetryPolicy,
    StageExecutor,
};
use gantry_orchestrator::registry::{
    AuthorizedRegistry, ImageRegistry, MemoryRegistry, PULL_ACTION, RegistryError,
};
use gantry_orchestrator::store::{MemoryStore, RunStore};
use gantry_orchestrator::{EngineError, Orchestrator};

#[derive(Debug, Clone)]
enum Behavior {
    /// Produce every declared output
    Succeed,
    /// Exit with a non-zero code
    Fail(i32),
    /// Report the environment unavailable `n` times, then succeed
    TransientThen(u32),
    AlwaysUnavailable,
    /// Push an image to `repository` through the authorized registry
    Push(String),
    /// Run until cancelled
    Hang,
    /// Produce the declared outputs plus an undeclared one
    ExtraOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Enter(String),
    Exit(String),
}

struct ScriptedEnvironment {
    behaviors: HashMap<String, Behavior>,
    registry: Arc<MemoryRegistry>,
    events: Mutex<Vec<Event>>,
    attempts: Mutex<HashMap<String, u32>>,
    received: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl ScriptedEnvironment {
    fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(stage, behavior)| (stage.to_string(), behavior.clone()))
                .collect(),
            registry: Arc::new(MemoryRegistry::new()),
            events: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            received: Mutex::new(HashMap::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn entered(&self, stage: &str) -> bool {
        self.events().contains(&Event::Enter(stage.to_string()))
    }

    fn received(&self, stage: &str) -> BTreeMap<String, Vec<u8>> {
        self.received
            .lock()
            .unwrap()
            .get(stage)
            .cloned()
            .unwrap_or_default()
    }

    /// Output content derived from the stage, the output and every input
    fn outputs(request: &ExecutionRequest) -> BTreeMap<String, Vec<u8>> {
        request
            .outputs
            .iter()
            .map(|name| {
                let mut content = format!("{}:{}<-", request.stage, name).into_bytes();
                for input in request.inputs.values() {
                    content.extend_from_slice(input);
                }
                (name.clone(), content)
            })
            .collect()
    }

    fn success(request: &ExecutionRequest) -> Result<ExecutionOutcome, EnvironmentError> {
        Ok(ExecutionOutcome {
            exit_code: 0,
            logs: Vec::new(),
            outputs: Self::outputs(request),
        })
    }

    async fn behave(
        &self,
        behavior: Behavior,
        request: &ExecutionRequest,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError> {
        match behavior {
            Behavior::Succeed => Self::success(request),
            Behavior::Fail(exit_code) => Ok(ExecutionOutcome {
                exit_code,
                ..Default::default()
            }),
            Behavior::TransientThen(failures) if attempt <= failures => Err(
                EnvironmentError::Unavailable("no capacity".to_string()),
            ),
            Behavior::TransientThen(_) => Self::success(request),
            Behavior::AlwaysUnavailable => {
                Err(EnvironmentError::Unavailable("no capacity".to_string()))
            }
            Behavior::Push(repository) => {
                let registry =
                    AuthorizedRegistry::new(self.registry.clone(), request.authorizer.clone());
                match registry.push(&repository, "latest", b"layers".to_vec()).await {
                    Ok(_) => Self::success(request),
                    Err(RegistryError::PermissionDenied(denied)) => {
                        Err(EnvironmentError::PermissionDenied(denied))
                    }
                    Err(e) => Err(EnvironmentError::Unavailable(e.to_string())),
                }
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(EnvironmentError::Cancelled)
            }
            Behavior::ExtraOutput => {
                let mut outputs = Self::outputs(request);
                outputs.insert("debug-symbols".to_string(), b"extra".to_vec());
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    logs: Vec::new(),
                    outputs,
                })
            }
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ScriptedEnvironment {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Enter(request.stage.clone()));
        self.received
            .lock()
            .unwrap()
            .insert(request.stage.clone(), request.inputs.clone());
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(request.stage.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let behavior = self
            .behaviors
            .get(&request.stage)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        let result = self.behave(behavior, &request, attempt, &cancel).await;

        self.events
            .lock()
            .unwrap()
            .push(Event::Exit(request.stage.clone()));
        result
    }
}

struct Harness {
    orchestrator: Orchestrator,
    environment: Arc<ScriptedEnvironment>,
    store: Arc<MemoryStore>,
    artifacts: Arc<MemoryArtifactStore>,
}

impl Harness {
    fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self::with_stores(
            ScriptedEnvironment::new(behaviors),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryArtifactStore::new()),
        )
    }

    /// A fresh orchestrator over existing stores, as after a restart
    fn with_stores(
        environment: Arc<ScriptedEnvironment>,
        store: Arc<MemoryStore>,
        artifacts: Arc<MemoryArtifactStore>,
    ) -> Self {
        let executor = StageExecutor::new(environment.clone())
            .with_retry(RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
            .with_cancel_grace(Duration::from_millis(100));
        let approvers = GrantSet::new(vec![PermissionGrant::new(
            "oncall",
            "gate/*",
            [APPROVAL_ACTION],
        )]);

        let orchestrator =
            Orchestrator::new(store.clone(), artifacts.clone(), executor, approvers);
        Self {
            orchestrator,
            environment,
            store,
            artifacts,
        }
    }

    async fn register(&self, definition: PipelineDefinition) -> PipelineDefinition {
        self.orchestrator
            .register_definition(definition)
            .await
            .unwrap()
    }

    async fn trigger(&self, definition: &str) -> PipelineRun {
        self.orchestrator
            .trigger(definition, event("main"))
            .await
            .unwrap()
    }

    async fn finish(&self, run: &PipelineRun) -> PipelineRun {
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.wait(run.id))
            .await
            .expect("run did not finish")
            .unwrap()
    }

    async fn at_gate(&self, run: &PipelineRun) -> PipelineRun {
        tokio::time::timeout(
            Duration::from_secs(10),
            self.orchestrator
                .wait_until(run.id, |status| status == RunStatus::AwaitingApproval),
        )
        .await
        .expect("run did not reach its gate")
        .unwrap()
    }

    async fn content(&self, run: &PipelineRun, stage: &str, name: &str) -> Vec<u8> {
        self.artifacts
            .get(&ArtifactRef::new(run.id, stage, name))
            .await
            .unwrap()
    }
}

fn event(branch: &str) -> TriggerEvent {
    TriggerEvent {
        branch: branch.to_string(),
        revision: Some("abc123".to_string()),
        source_ref: "git://yolo-v6@abc123".to_string(),
    }
}

/// Build, approval, deploy
fn gated_deploy() -> PipelineDefinition {
    PipelineDefinition::new(
        "gated",
        vec![
            StageSpec::build("build", "builder:1")
                .with_inputs([SOURCE_ARTIFACT])
                .with_outputs(["image"]),
            StageSpec::approval("approve").with_approver("release-manager"),
            StageSpec::deploy("deploy", "deployer:1")
                .with_inputs(["image"])
                .with_outputs(["receipt"]),
        ],
    )
    .with_branch("main")
}

fn four_stages() -> PipelineDefinition {
    PipelineDefinition::new(
        "four",
        vec![
            StageSpec::build("one", "img:1").with_outputs(["a"]),
            StageSpec::build("two", "img:1")
                .with_inputs(["a"])
                .with_outputs(["b"]),
            StageSpec::deploy("three", "img:1")
                .with_inputs(["b"])
                .with_outputs(["c"]),
            StageSpec::deploy("four", "img:1").with_inputs(["c"]),
        ],
    )
    .with_branch("main")
}

fn single(stage: StageSpec) -> PipelineDefinition {
    PipelineDefinition::new("single", vec![stage]).with_branch("main")
}

#[tokio::test]
async fn test_approved_run_binds_exact_artifacts() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;

    let run = harness.trigger("gated").await;
    let waiting = harness.at_gate(&run).await;
    assert_eq!(waiting.current_stage, 1);
    assert!(!harness.environment.entered("deploy"));

    harness
        .orchestrator
        .decide(run.id, "approve", Decision::Approve, "release-manager", None)
        .await
        .unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert!(finished.failure.is_none());
    assert!(finished
        .stages
        .iter()
        .all(|stage| stage.status == StageStatus::Succeeded));

    let image = harness.content(&run, "build", "image").await;
    assert_eq!(image, b"build:image<-git://yolo-v6@abc123");

    // Deploy consumed exactly the bytes the build committed
    let received = harness.environment.received("deploy");
    assert_eq!(received.len(), 1);
    assert_eq!(received["image"], image);

    let mut receipt = b"deploy:receipt<-".to_vec();
    receipt.extend_from_slice(&image);
    assert_eq!(harness.content(&run, "deploy", "receipt").await, receipt);

    let bound: Vec<_> = finished.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(bound, [SOURCE_ARTIFACT, "image", "receipt"]);
}

#[tokio::test]
async fn test_rejected_gate_fails_and_skips_deploy() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;

    let run = harness.trigger("gated").await;
    harness.at_gate(&run).await;
    harness
        .orchestrator
        .decide(
            run.id,
            "approve",
            Decision::Reject,
            "release-manager",
            Some("not today".to_string()),
        )
        .await
        .unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Failed);

    let failure = finished.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::ApprovalRejected);
    assert_eq!(failure.stage, "approve");
    assert!(failure.message.contains("not today"));

    assert_eq!(finished.stages[2].status, StageStatus::Skipped);
    assert!(!harness.environment.entered("deploy"));
}

#[tokio::test]
async fn test_failure_stops_the_run() {
    let harness = Harness::new(&[("two", Behavior::Fail(3))]);
    harness.register(four_stages()).await;

    let run = harness.trigger("four").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    let failure = finished.failure.unwrap();
    assert_eq!(failure.stage_index, 1);
    assert_eq!(failure.stage, "two");
    assert_eq!(failure.kind, ErrorKind::ExecutorApplicationFailure);

    let statuses: Vec<_> = finished.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped
        ]
    );
    assert!(!harness.environment.entered("three"));
    assert!(!harness.environment.entered("four"));
}

#[tokio::test]
async fn test_stages_run_strictly_in_order() {
    let harness = Harness::new(&[]);
    harness.register(four_stages()).await;

    let run = harness.trigger("four").await;
    assert_eq!(harness.finish(&run).await.status, RunStatus::Succeeded);

    let expected: Vec<Event> = ["one", "two", "three", "four"]
        .iter()
        .flat_map(|stage| [Event::Enter(stage.to_string()), Event::Exit(stage.to_string())])
        .collect();
    assert_eq!(harness.environment.events(), expected);
}

#[tokio::test]
async fn test_pull_only_stage_cannot_push() {
    let harness = Harness::new(&[("publish", Behavior::Push("yolo".to_string()))]);
    harness
        .register(single(
            StageSpec::build("publish", "builder:1")
                .with_grant(PermissionGrant::for_stage("registry/yolo", [PULL_ACTION])),
        ))
        .await;

    let run = harness.trigger("single").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().kind, ErrorKind::PermissionDenied);
    // Never retried
    assert_eq!(finished.stages[0].attempts, 1);
    assert!(!harness.environment.registry.contains("yolo", "latest"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new(&[("build", Behavior::TransientThen(2))]);
    harness
        .register(single(StageSpec::build("build", "builder:1").with_outputs(["image"])))
        .await;

    let run = harness.trigger("single").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(finished.stages[0].attempts, 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let harness = Harness::new(&[("build", Behavior::AlwaysUnavailable)]);
    harness
        .register(single(StageSpec::build("build", "builder:1")))
        .await;

    let run = harness.trigger("single").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(
        finished.failure.unwrap().kind,
        ErrorKind::ExecutorTransientFailure
    );
    assert_eq!(finished.stages[0].attempts, 3);
}

#[tokio::test]
async fn test_undeclared_output_is_a_contract_violation() {
    let harness = Harness::new(&[("build", Behavior::ExtraOutput)]);
    harness
        .register(single(StageSpec::build("build", "builder:1").with_outputs(["image"])))
        .await;

    let run = harness.trigger("single").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.failure.unwrap().kind, ErrorKind::ContractViolation);
    // Nothing from a violating stage is committed
    assert!(
        !harness
            .artifacts
            .contains(&ArtifactRef::new(run.id, "build", "image"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_cancel_stops_the_executing_stage() {
    let harness = Harness::new(&[("two", Behavior::Hang)]);
    harness.register(four_stages()).await;
    let run = harness.trigger("four").await;

    for _ in 0..500 {
        if harness.environment.entered("two") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.environment.entered("two"));

    let cancelled = harness.orchestrator.cancel(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(finished.failure.unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(finished.stages[1].status, StageStatus::Cancelled);
    assert_eq!(finished.stages[2].status, StageStatus::Skipped);
    assert!(!harness.environment.entered("three"));

    // Committed artifacts survive cancellation
    assert_eq!(harness.content(&run, "one", "a").await, b"one:a<-");

    assert!(matches!(
        harness.orchestrator.cancel(run.id).await,
        Err(EngineError::RunFinished(_))
    ));
}

#[tokio::test]
async fn test_cancel_wakes_a_pending_gate() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;

    let run = harness.trigger("gated").await;
    harness.at_gate(&run).await;
    harness.orchestrator.cancel(run.id).await.unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(finished.stages[1].status, StageStatus::Cancelled);
}

#[tokio::test]
async fn test_unanswered_gate_expires() {
    let harness = Harness::new(&[]);
    let mut definition = gated_deploy();
    definition.stages[1] = definition.stages[1].clone().with_approval_timeout(1);
    harness.register(definition).await;

    let run = harness.trigger("gated").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().kind, ErrorKind::ApprovalExpired);
    assert!(!harness.environment.entered("deploy"));
}

#[tokio::test]
async fn test_definition_wide_approval_timeout_expires_gate() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy().with_approval_timeout(1)).await;

    let run = harness.trigger("gated").await;
    let finished = harness.finish(&run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    let failure = finished.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::ApprovalExpired);
    assert_eq!(failure.stage_index, 1);
    assert!(!harness.environment.entered("deploy"));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;
    harness.register(four_stages()).await;

    let parked = harness.trigger("gated").await;
    let released = harness.trigger("gated").await;
    let ungated = harness.trigger("four").await;

    harness.at_gate(&parked).await;
    harness.at_gate(&released).await;

    // A run with no gate finishes while two others wait on theirs
    assert_eq!(harness.finish(&ungated).await.status, RunStatus::Succeeded);

    harness
        .orchestrator
        .decide(released.id, "approve", Decision::Approve, "release-manager", None)
        .await
        .unwrap();
    let finished = harness.finish(&released).await;
    assert_eq!(finished.status, RunStatus::Succeeded);

    // Deciding one run's gate leaves the other run's gate pending
    let still_parked = harness.orchestrator.get_run(parked.id).await.unwrap();
    assert_eq!(still_parked.status, RunStatus::AwaitingApproval);
    assert!(
        harness
            .store
            .get_decision(&GateId::new(parked.id, "approve"))
            .await
            .unwrap()
            .is_none()
    );

    for run in [&parked, &released, &ungated] {
        let artifacts = harness.orchestrator.list_artifacts(run.id).await.unwrap();
        assert!(!artifacts.is_empty());
        assert!(artifacts.iter().all(|a| a.reference.run_id == run.id));
    }

    let parked_names: Vec<String> = harness
        .orchestrator
        .list_artifacts(parked.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.reference.name)
        .collect();
    assert!(!parked_names.contains(&"receipt".to_string()));

    harness
        .orchestrator
        .decide(parked.id, "approve", Decision::Reject, "oncall", None)
        .await
        .unwrap();
    assert_eq!(harness.finish(&parked).await.status, RunStatus::Failed);
    assert_eq!(
        harness.orchestrator.get_run(released.id).await.unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_gate_decisions_are_authorized_and_idempotent() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;

    let run = harness.trigger("gated").await;

    // Not a gate at all
    assert!(matches!(
        harness
            .orchestrator
            .decide(run.id, "build", Decision::Approve, "oncall", None)
            .await,
        Err(EngineError::NotAGate { .. })
    ));

    harness.at_gate(&run).await;

    let denied = harness
        .orchestrator
        .decide(run.id, "approve", Decision::Approve, "mallory", None)
        .await;
    assert!(matches!(denied, Err(EngineError::PermissionDenied(_))));
    let still_waiting = harness.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(still_waiting.status, RunStatus::AwaitingApproval);

    // Operator-level approver
    let first = harness
        .orchestrator
        .decide(run.id, "approve", Decision::Approve, "oncall", None)
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .decide(run.id, "approve", Decision::Reject, "release-manager", None)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(second.decision, Decision::Approve);

    assert_eq!(harness.finish(&run).await.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_trigger_checks_branch_and_definition() {
    let harness = Harness::new(&[]);
    harness.register(gated_deploy()).await;

    assert!(matches!(
        harness.orchestrator.trigger("gated", event("feature/x")).await,
        Err(EngineError::BranchMismatch { .. })
    ));
    assert!(matches!(
        harness.orchestrator.trigger("missing", event("main")).await,
        Err(EngineError::DefinitionNotFound(_))
    ));
}

#[tokio::test]
async fn test_runs_keep_their_definition_version() {
    let harness = Harness::new(&[("build", Behavior::Hang)]);
    let first = harness
        .register(single(StageSpec::build("build", "builder:1")))
        .await;
    let run = harness.trigger("single").await;

    let second = harness
        .register(single(StageSpec::build("build", "builder:2")))
        .await;
    assert_eq!(second.version, first.version + 1);

    let current = harness.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(current.definition.version, first.version);
    assert_eq!(
        current.definition.stages[0].execution.as_ref().unwrap().image,
        "builder:1"
    );

    harness.orchestrator.cancel(run.id).await.unwrap();
}

/// A run persisted mid-stage, as left behind by a crashed orchestrator
async fn interrupted_run(
    store: &MemoryStore,
    artifacts: &MemoryArtifactStore,
    definition: PipelineDefinition,
    committed: &[&str],
) -> PipelineRun {
    let definition = store.insert_definition(definition).await.unwrap();
    let mut run = PipelineRun::new(definition, event("main"));

    let source = artifacts
        .put(run.id, SOURCE_ARTIFACT, SOURCE_ARTIFACT, b"git://src".to_vec())
        .await
        .unwrap();
    run.bind_artifact(source);
    run.start_stage(0);

    for name in committed {
        artifacts
            .put(run.id, &run.stages[0].name, name, b"committed".to_vec())
            .await
            .unwrap();
    }

    store.save_run(&run).await.unwrap();
    run
}

fn two_outputs() -> PipelineDefinition {
    PipelineDefinition::new(
        "resumable",
        vec![
            StageSpec::build("build", "builder:1").with_outputs(["image", "sbom"]),
            StageSpec::deploy("deploy", "deployer:1").with_inputs(["image"]),
        ],
    )
    .with_branch("main")
}

#[tokio::test]
async fn test_resume_treats_fully_committed_stage_as_done() {
    let store = Arc::new(MemoryStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let run = interrupted_run(&store, &artifacts, two_outputs(), &["image", "sbom"]).await;

    let harness = Harness::with_stores(ScriptedEnvironment::new(&[]), store, artifacts);
    assert_eq!(harness.orchestrator.resume().await.unwrap(), 1);

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert!(!harness.environment.entered("build"));
    assert_eq!(harness.environment.received("deploy")["image"], b"committed");
}

#[tokio::test]
async fn test_resume_fails_partially_committed_stage() {
    let store = Arc::new(MemoryStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let run = interrupted_run(&store, &artifacts, two_outputs(), &["image"]).await;

    let harness = Harness::with_stores(ScriptedEnvironment::new(&[]), store, artifacts);
    harness.orchestrator.resume().await.unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().kind, ErrorKind::ContractViolation);
    assert!(harness.environment.events().is_empty());
}

#[tokio::test]
async fn test_resume_redispatches_stage_without_outputs() {
    let store = Arc::new(MemoryStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let run = interrupted_run(&store, &artifacts, two_outputs(), &[]).await;

    let harness = Harness::with_stores(ScriptedEnvironment::new(&[]), store, artifacts);
    harness.orchestrator.resume().await.unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert!(harness.environment.entered("build"));
}

#[tokio::test]
async fn test_gate_decided_before_restart_stays_decided() {
    let store = Arc::new(MemoryStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());

    let definition = store.insert_definition(gated_deploy()).await.unwrap();
    let mut run = PipelineRun::new(definition, event("main"));
    let image = artifacts
        .put(run.id, "build", "image", b"image-bytes".to_vec())
        .await
        .unwrap();
    run.start_stage(0);
    run.complete_stage(0, vec![image]);
    run.await_approval(1);
    store.save_run(&run).await.unwrap();

    store
        .record_decision(&ApprovalDecision::new(
            GateId::new(run.id, "approve"),
            Decision::Approve,
            "release-manager",
        ))
        .await
        .unwrap();

    let harness = Harness::with_stores(ScriptedEnvironment::new(&[]), store, artifacts);
    harness.orchestrator.resume().await.unwrap();

    let finished = harness.finish(&run).await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(harness.environment.received("deploy")["image"], b"image-bytes");
}
