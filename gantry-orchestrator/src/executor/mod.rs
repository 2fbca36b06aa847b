//! Stage Executor
//!
//! Runs one build or deploy stage inside an [`ExecutionEnvironment`]:
//! authorizes the stage's declared actions, hands the environment exactly
//! the resolved inputs and the stage's own grants, retries environment
//! failures with exponential backoff and checks that the declared outputs,
//! and only those, came back.

pub mod podman;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::domain::definition::{ExecutionConfig, PipelineDefinition, StageKind, StageSpec};
use gantry_core::domain::log::LogEntry;
use gantry_core::{Authorizer, ErrorKind, GrantSet, PermissionDenied};

pub use podman::{PodmanEnvironment, PodmanRegistry};

/// Environment variable holding the stage's grants as JSON
pub const GRANTS_ENV: &str = "GANTRY_GRANTS";
pub const RUN_ID_ENV: &str = "GANTRY_RUN_ID";
pub const STAGE_ENV: &str = "GANTRY_STAGE";
pub const IDENTITY_ENV: &str = "GANTRY_EXECUTOR_IDENTITY";

/// Everything an environment needs for one attempt of a stage
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: Uuid,
    pub stage: String,
    pub kind: StageKind,
    pub attempt: u32,
    pub config: ExecutionConfig,
    /// Resolved input artifacts by name
    pub inputs: BTreeMap<String, Vec<u8>>,
    /// Names of the outputs the stage must produce
    pub outputs: Vec<String>,
    /// Stage environment plus the permission-scoped credential
    pub env: BTreeMap<String, String>,
    /// Must be consulted before any externally visible action
    pub authorizer: Authorizer,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub logs: Vec<LogEntry>,
    pub outputs: BTreeMap<String, Vec<u8>>,
}

/// Failures of the environment itself, as opposed to the stage's program
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("execution environment unavailable: {0}")]
    Unavailable(String),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error("execution cancelled")]
    Cancelled,
}

impl EnvironmentError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EnvironmentError::Unavailable(_) | EnvironmentError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Run one attempt of a stage.
    ///
    /// A non-zero exit code is an application failure and is returned as an
    /// `Ok` outcome; `Err` is reserved for the environment failing to run
    /// the stage at all. Implementations should stop promptly once `cancel`
    /// fires.
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError>;
}

/// Exponential backoff for transient environment failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubles each time, capped
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    PermissionDenied(PermissionDenied),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("stage exited with code {exit_code}")]
    Application { exit_code: i32 },

    #[error("execution environment failed after {attempts} attempt(s): {last}")]
    TransientExhausted { attempts: u32, last: String },

    #[error("stage cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ExecutorError::ContractViolation(_) => ErrorKind::ContractViolation,
            ExecutorError::Application { .. } => ErrorKind::ExecutorApplicationFailure,
            ExecutorError::TransientExhausted { .. } => ErrorKind::ExecutorTransientFailure,
            ExecutorError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// What happened while executing a stage, across all attempts
#[derive(Debug)]
pub struct StageReport {
    pub attempts: u32,
    pub logs: Vec<LogEntry>,
    pub result: Result<BTreeMap<String, Vec<u8>>, ExecutorError>,
}

impl StageReport {
    fn rejected(error: ExecutorError) -> Self {
        Self {
            attempts: 0,
            logs: vec![LogEntry::error(error.to_string())],
            result: Err(error),
        }
    }
}

pub struct StageExecutor {
    environment: Arc<dyn ExecutionEnvironment>,
    retry: RetryPolicy,
    stage_timeout: Duration,
    cancel_grace: Duration,
}

impl StageExecutor {
    pub fn new(environment: Arc<dyn ExecutionEnvironment>) -> Self {
        Self {
            environment,
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Execute `stage` of `definition` with its resolved inputs
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        stage: &StageSpec,
        run_id: Uuid,
        inputs: BTreeMap<String, Vec<u8>>,
        cancel: &CancellationToken,
    ) -> StageReport {
        let Some(config) = stage.execution.clone() else {
            return StageReport::rejected(ExecutorError::ContractViolation(format!(
                "stage '{}' has no execution config",
                stage.name
            )));
        };

        let authorizer = Authorizer::new(
            definition.executor_identity(&stage.name),
            GrantSet::new(stage.grants.clone()),
        );

        for declared in &config.actions {
            if let Err(denied) = authorizer.check(&declared.action, &declared.resource) {
                warn!(%run_id, stage = %stage.name, "Declared action denied: {}", denied);
                return StageReport::rejected(ExecutorError::PermissionDenied(denied));
            }
        }

        let env = match credential_env(&config, run_id, &stage.name, &authorizer) {
            Ok(env) => env,
            Err(e) => {
                return StageReport::rejected(ExecutorError::ContractViolation(format!(
                    "cannot encode grants: {}",
                    e
                )));
            }
        };

        let timeout = config
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.stage_timeout);

        let mut request = ExecutionRequest {
            run_id,
            stage: stage.name.clone(),
            kind: stage.kind,
            attempt: 0,
            config,
            inputs,
            outputs: stage.outputs.clone(),
            env,
            authorizer,
        };

        let mut logs = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            request.attempt = attempt;

            if cancel.is_cancelled() {
                return StageReport {
                    attempts: attempt - 1,
                    logs,
                    result: Err(ExecutorError::Cancelled),
                };
            }

            debug!(%run_id, stage = %stage.name, attempt, "Dispatching stage");
            let result = self.attempt(request.clone(), timeout, cancel).await;

            let error = match result {
                Ok(outcome) => {
                    logs.extend(outcome.logs);

                    let result = if outcome.exit_code != 0 {
                        Err(ExecutorError::Application {
                            exit_code: outcome.exit_code,
                        })
                    } else {
                        check_contract(&stage.outputs, &outcome.outputs).map(|_| outcome.outputs)
                    };

                    if let Err(e) = &result {
                        logs.push(LogEntry::error(e.to_string()));
                    }
                    return StageReport {
                        attempts: attempt,
                        logs,
                        result,
                    };
                }
                Err(error) => error,
            };

            let result = match error {
                EnvironmentError::PermissionDenied(denied) => {
                    Err(ExecutorError::PermissionDenied(denied))
                }
                EnvironmentError::Cancelled => Err(ExecutorError::Cancelled),
                transient if attempt > self.retry.max_retries => {
                    Err(ExecutorError::TransientExhausted {
                        attempts: attempt,
                        last: transient.to_string(),
                    })
                }
                transient => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        %run_id,
                        stage = %stage.name,
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.retry.max_retries + 1,
                        transient,
                        delay
                    );
                    logs.push(LogEntry::warning(format!(
                        "attempt {} failed: {}",
                        attempt, transient
                    )));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                    }
                }
            };

            if let Err(e) = &result {
                logs.push(LogEntry::error(e.to_string()));
            }
            return StageReport {
                attempts: attempt,
                logs,
                result,
            };
        }
    }

    /// One attempt, bounded by the stage timeout and the run's cancellation
    async fn attempt(
        &self,
        request: ExecutionRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError> {
        let stop = cancel.child_token();
        let execution = self.environment.execute(request, stop.clone());
        tokio::pin!(execution);

        let timed_out = tokio::select! {
            result = &mut execution => return result,
            _ = tokio::time::sleep(timeout) => true,
            _ = cancel.cancelled() => false,
        };

        stop.cancel();
        self.wind_down(execution).await;

        if timed_out {
            Err(EnvironmentError::Timeout(timeout))
        } else {
            Err(EnvironmentError::Cancelled)
        }
    }

    /// Give a stopped environment the grace period, then abandon it
    async fn wind_down<F>(&self, execution: std::pin::Pin<&mut F>)
    where
        F: std::future::Future<Output = Result<ExecutionOutcome, EnvironmentError>>,
    {
        if tokio::time::timeout(self.cancel_grace, execution).await.is_err() {
            warn!(
                "Execution environment did not stop within {:?}; abandoning it",
                self.cancel_grace
            );
        } else {
            info!("Execution environment stopped");
        }
    }
}

/// Stage environment plus the credential an environment hands to the
/// stage's program
fn credential_env(
    config: &ExecutionConfig,
    run_id: Uuid,
    stage: &str,
    authorizer: &Authorizer,
) -> Result<BTreeMap<String, String>, serde_json::Error> {
    let mut env = config.env.clone();
    env.insert(GRANTS_ENV.to_string(), serde_json::to_string(authorizer.grants())?);
    env.insert(RUN_ID_ENV.to_string(), run_id.to_string());
    env.insert(STAGE_ENV.to_string(), stage.to_string());
    env.insert(IDENTITY_ENV.to_string(), authorizer.identity().to_string());
    Ok(env)
}

fn check_contract(
    declared: &[String],
    produced: &BTreeMap<String, Vec<u8>>,
) -> Result<(), ExecutorError> {
    let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
    let produced: BTreeSet<&str> = produced.keys().map(String::as_str).collect();

    let missing: Vec<&str> = declared.difference(&produced).copied().collect();
    let extra: Vec<&str> = produced.difference(&declared).copied().collect();

    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing outputs [{}]", missing.join(", ")));
    }
    if !extra.is_empty() {
        problems.push(format!("undeclared outputs [{}]", extra.join(", ")));
    }
    Err(ExecutorError::ContractViolation(problems.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::domain::permission::PermissionGrant;
    use std::sync::Mutex;

    /// Environment replaying a fixed sequence of attempt results
    struct Replay {
        results: Mutex<Vec<Result<ExecutionOutcome, EnvironmentError>>>,
        requests: Mutex<Vec<ExecutionRequest>>,
    }

    impl Replay {
        fn new(mut results: Vec<Result<ExecutionOutcome, EnvironmentError>>) -> Arc<Self> {
            results.reverse();
            Arc::new(Self {
                results: Mutex::new(results),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ExecutionEnvironment for Replay {
        async fn execute(
            &self,
            request: ExecutionRequest,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, EnvironmentError> {
            self.requests.lock().unwrap().push(request);
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(EnvironmentError::Unavailable("exhausted".to_string())))
        }
    }

    /// Environment that only returns once cancelled, or never
    struct Stuck {
        honour_cancel: bool,
    }

    #[async_trait]
    impl ExecutionEnvironment for Stuck {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, EnvironmentError> {
            if self.honour_cancel {
                cancel.cancelled().await;
                Err(EnvironmentError::Cancelled)
            } else {
                std::future::pending().await
            }
        }
    }

    fn success(outputs: &[(&str, &[u8])]) -> Result<ExecutionOutcome, EnvironmentError> {
        Ok(ExecutionOutcome {
            exit_code: 0,
            logs: vec![LogEntry::info("done")],
            outputs: outputs
                .iter()
                .map(|(name, content)| (name.to_string(), content.to_vec()))
                .collect(),
        })
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition::new(
            "app",
            vec![
                StageSpec::build("build", "alpine:3")
                    .with_outputs(["image"])
                    .with_grant(PermissionGrant::for_stage("registry/app", ["registry:pull"])),
            ],
        )
    }

    async fn run(
        executor: &StageExecutor,
        definition: &PipelineDefinition,
        cancel: &CancellationToken,
    ) -> StageReport {
        executor
            .execute(
                definition,
                &definition.stages[0],
                Uuid::new_v4(),
                BTreeMap::new(),
                cancel,
            )
            .await
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
        assert_eq!(policy.delay(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_success_passes_credential() {
        let env = Replay::new(vec![success(&[("image", b"layers")])]);
        let executor = StageExecutor::new(env.clone());

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        let outputs = report.result.unwrap();
        assert_eq!(outputs["image"], b"layers");
        assert_eq!(report.attempts, 1);

        let requests = env.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.env[IDENTITY_ENV], "stage/app/build");
        assert!(request.env[GRANTS_ENV].contains("registry:pull"));
        assert_eq!(request.outputs, vec!["image"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let env = Replay::new(vec![
            Err(EnvironmentError::Unavailable("no capacity".to_string())),
            Err(EnvironmentError::Timeout(Duration::from_secs(1))),
            success(&[("image", b"layers")]),
        ]);
        let executor = StageExecutor::new(env).with_retry(fast_retry());

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        assert!(report.result.is_ok());
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let env = Replay::new(vec![]);
        let executor = StageExecutor::new(env.clone()).with_retry(fast_retry());

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutorTransientFailure);
        assert_eq!(report.attempts, 3);
        assert_eq!(env.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_application_failure_is_not_retried() {
        let env = Replay::new(vec![Ok(ExecutionOutcome {
            exit_code: 2,
            ..Default::default()
        })]);
        let executor = StageExecutor::new(env.clone()).with_retry(fast_retry());

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        assert_eq!(
            report.result.unwrap_err().kind(),
            ErrorKind::ExecutorApplicationFailure
        );
        assert_eq!(env.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let denied = PermissionDenied {
            identity: "stage/app/build".to_string(),
            action: "registry:push".to_string(),
            resource: "registry/app".to_string(),
        };
        let env = Replay::new(vec![Err(EnvironmentError::PermissionDenied(denied))]);
        let executor = StageExecutor::new(env.clone()).with_retry(fast_retry());

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        assert_eq!(report.result.unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_ungranted_declared_action_never_dispatches() {
        let env = Replay::new(vec![success(&[("image", b"layers")])]);
        let executor = StageExecutor::new(env.clone());

        // Built directly, bypassing definition validation
        let mut definition = definition();
        definition.stages[0] = definition.stages[0]
            .clone()
            .with_action("registry:push", "registry/app");

        let report = run(&executor, &definition, &CancellationToken::new()).await;
        assert_eq!(report.result.unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(report.attempts, 0);
        assert!(env.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_contract() {
        let env = Replay::new(vec![success(&[("image", b"x"), ("debug", b"y")])]);
        let executor = StageExecutor::new(env);
        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(err.to_string().contains("debug"));

        let env = Replay::new(vec![success(&[])]);
        let executor = StageExecutor::new(env);
        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        assert!(report.result.unwrap_err().to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let executor = StageExecutor::new(Arc::new(Stuck { honour_cancel: true }))
            .with_retry(RetryPolicy {
                max_retries: 0,
                ..fast_retry()
            })
            .with_stage_timeout(Duration::from_millis(20))
            .with_cancel_grace(Duration::from_millis(20));

        let report = run(&executor, &definition(), &CancellationToken::new()).await;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutorTransientFailure);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_abandons_unresponsive_environment() {
        let executor = StageExecutor::new(Arc::new(Stuck {
            honour_cancel: false,
        }))
        .with_cancel_grace(Duration::from_millis(20));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = run(&executor, &definition(), &cancel).await;
        assert_eq!(report.result.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
