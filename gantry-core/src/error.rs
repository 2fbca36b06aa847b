//! Error taxonomy shared by every Gantry component

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::definition::MAX_APPROVAL_TIMEOUT_SECONDS;

/// Tag recorded on a failed stage and run so operators can tell exactly
/// why it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    UnresolvedArtifact,
    DuplicateArtifact,
    ContractViolation,
    ExecutorTransientFailure,
    ExecutorApplicationFailure,
    ApprovalRejected,
    ApprovalExpired,
    PermissionDenied,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::UnresolvedArtifact => "UnresolvedArtifact",
            ErrorKind::DuplicateArtifact => "DuplicateArtifact",
            ErrorKind::ContractViolation => "ContractViolation",
            ErrorKind::ExecutorTransientFailure => "ExecutorTransientFailure",
            ErrorKind::ExecutorApplicationFailure => "ExecutorApplicationFailure",
            ErrorKind::ApprovalRejected => "ApprovalRejected",
            ErrorKind::ApprovalExpired => "ApprovalExpired",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Only infrastructure hiccups are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ExecutorTransientFailure)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline definition failed definition-time checks.
///
/// Carries every issue found so authors can fix them in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pipeline definition: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationError
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("pipeline name cannot be empty")]
    EmptyPipelineName,

    #[error("pipeline must have at least one stage")]
    NoStages,

    #[error("stage #{index} has an empty name")]
    EmptyStageName { index: usize },

    #[error("stage name '{0}' is reserved")]
    ReservedStageName(String),

    #[error("stage name '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{stage}' consumes '{artifact}' which no earlier stage produces")]
    UnresolvedInput { stage: String, artifact: String },

    #[error("stage '{stage}' consumes '{artifact}' before stage '{producer}' produces it")]
    ForwardReference {
        stage: String,
        artifact: String,
        producer: String,
    },

    #[error("stage '{stage}' consumes its own output '{artifact}'")]
    SelfReference { stage: String, artifact: String },

    #[error("artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("stage '{stage}' names an invalid artifact '{artifact}'")]
    InvalidArtifactName { stage: String, artifact: String },

    #[error("stage '{stage}' declares the reserved output '{artifact}'")]
    ReservedOutput { stage: String, artifact: String },

    #[error("approval stage '{0}' cannot declare input or output artifacts")]
    ApprovalWithArtifacts(String),

    #[error("approval stage '{0}' cannot carry an execution config")]
    ApprovalWithExecution(String),

    #[error("stage '{0}' needs an execution config with a container image")]
    MissingImage(String),

    #[error("stage '{stage}' declares '{action}' on '{resource}' without a matching grant")]
    UngrantedAction {
        stage: String,
        action: String,
        resource: String,
    },

    #[error("stage '{stage}' has a malformed grant pattern '{pattern}': {reason}")]
    InvalidGrantPattern {
        stage: String,
        pattern: String,
        reason: String,
    },

    #[error(
        "approval timeout of {seconds}s for {scope} must be between 1 and {max} seconds",
        max = MAX_APPROVAL_TIMEOUT_SECONDS
    )]
    ApprovalTimeoutOutOfRange { scope: String, seconds: u64 },
}
