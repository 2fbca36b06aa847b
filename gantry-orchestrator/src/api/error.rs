//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::artifact::ArtifactError;
use crate::engine::EngineError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Forbidden(String),
    /// Definition rejected, with every issue found
    Invalid { message: String, issues: Vec<String> },
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, serde_json::json!({ "error": msg })),
            ApiError::Invalid { message, issues } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": message, "issues": issues }),
            ),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Validation(invalid) => ApiError::Invalid {
                message,
                issues: invalid.issues.iter().map(ToString::to_string).collect(),
            },
            EngineError::InvalidSource(_) | EngineError::BranchMismatch { .. } => {
                ApiError::BadRequest(message)
            }
            EngineError::DefinitionNotFound(_)
            | EngineError::RunNotFound(_)
            | EngineError::NotAGate { .. }
            | EngineError::Artifact(ArtifactError::NotFound(_)) => ApiError::NotFound(message),
            EngineError::RunFinished(_)
            | EngineError::GateNotOpen(_)
            | EngineError::Artifact(ArtifactError::Duplicate(_)) => ApiError::Conflict(message),
            EngineError::PermissionDenied(_) => ApiError::Forbidden(message),
            EngineError::Artifact(_) | EngineError::Store(_) => ApiError::InternalError(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
