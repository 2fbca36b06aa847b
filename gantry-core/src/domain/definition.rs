//! Pipeline definition domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::permission::{APPROVAL_ACTION, PermissionGrant};

/// Name of the artifact bound to the trigger's source snapshot.
///
/// It is produced by the pseudo-stage of the same name when a run is created,
/// so every stage may consume it without an explicit producer.
pub const SOURCE_ARTIFACT: &str = "source";

/// Longest window a gate may stay open before it expires
pub const MAX_APPROVAL_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Pipeline definition
///
/// An ordered, strictly linear sequence of stages. A stored version is never
/// modified; registering a definition under an existing name creates a new
/// version, and each run carries a full snapshot of the version it started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: Uuid,
    pub version: u32,
    pub name: String,
    pub description: Option<String>,
    pub trigger: TriggerConfig,
    pub stages: Vec<StageSpec>,
    /// Gate window for approval stages that do not set their own
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            description: None,
            trigger: TriggerConfig::default(),
            stages,
            approval_timeout_seconds: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.trigger.branch = branch.into();
        self
    }

    pub fn with_approval_timeout(mut self, seconds: u64) -> Self {
        self.approval_timeout_seconds = Some(seconds);
        self
    }

    /// Effective gate window for `stage`: its own timeout, else the
    /// definition-wide default
    pub fn approval_timeout(&self, stage: &StageSpec) -> Option<u64> {
        stage
            .approval
            .as_ref()
            .and_then(|config| config.timeout_seconds)
            .or(self.approval_timeout_seconds)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Identity under which the executor of `stage` acts
    pub fn executor_identity(&self, stage: &str) -> String {
        format!("stage/{}/{}", self.name, stage)
    }
}

/// Which source events start a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub branch: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
        }
    }
}

/// Kind of work a stage performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Build,
    Deploy,
    Approval,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Build => "build",
            StageKind::Deploy => "deploy",
            StageKind::Approval => "approval",
        }
    }

    /// Build and deploy stages are dispatched to an execution environment
    pub fn is_executable(&self) -> bool {
        !matches!(self, StageKind::Approval)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "build" => Ok(StageKind::Build),
            "deploy" => Ok(StageKind::Deploy),
            "approval" => Ok(StageKind::Approval),
            other => Err(format!("unknown stage kind '{}'", other)),
        }
    }
}

/// One ordered unit of pipeline work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub grants: Vec<PermissionGrant>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
}

impl StageSpec {
    fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            grants: Vec::new(),
            execution: None,
            approval: None,
        }
    }

    pub fn build(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut stage = Self::new(name, StageKind::Build);
        stage.execution = Some(ExecutionConfig::new(image));
        stage
    }

    pub fn deploy(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut stage = Self::new(name, StageKind::Deploy);
        stage.execution = Some(ExecutionConfig::new(image));
        stage
    }

    pub fn approval(name: impl Into<String>) -> Self {
        let mut stage = Self::new(name, StageKind::Approval);
        stage.approval = Some(ApprovalConfig::default());
        stage
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grant(mut self, grant: PermissionGrant) -> Self {
        self.grants.push(grant);
        self
    }

    /// Allow `actor` to decide this stage's gate
    pub fn with_approver(self, actor: impl Into<String>) -> Self {
        let resource = self.gate_resource();
        self.with_grant(PermissionGrant::new(actor, resource, [APPROVAL_ACTION]))
    }

    pub fn with_approval_timeout(mut self, seconds: u64) -> Self {
        self.approval
            .get_or_insert_with(ApprovalConfig::default)
            .timeout_seconds = Some(seconds);
        self
    }

    /// Declare an external action the stage performs
    pub fn with_action(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        if let Some(execution) = self.execution.as_mut() {
            execution.actions.push(DeclaredAction {
                action: action.into(),
                resource: resource.into(),
            });
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(execution) = self.execution.as_mut() {
            execution.env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let Some(execution) = self.execution.as_mut() {
            execution.command = command.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Resource naming this stage's approval gate
    pub fn gate_resource(&self) -> String {
        format!("gate/{}", self.name)
    }
}

/// How a build or deploy stage is executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<DeclaredAction>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub privileged: bool,
}

impl ExecutionConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            actions: Vec::new(),
            timeout_seconds: None,
            privileged: false,
        }
    }
}

/// An externally visible action a stage declares up front
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredAction {
    pub action: String,
    pub resource: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Pending gates expire into a rejection after this many seconds
    pub timeout_seconds: Option<u64>,
}
