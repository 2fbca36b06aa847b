//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod approval;
pub mod definition;
pub mod error;
pub mod health;
pub mod run;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::engine::Orchestrator;

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Definition endpoints
        .route(
            "/api/definitions",
            post(definition::register_definition).get(definition::list_definitions),
        )
        .route("/api/definitions/{id}", get(definition::get_definition))
        // Run endpoints
        .route("/api/trigger", post(run::trigger_run))
        .route("/api/runs", get(run::list_runs))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/runs/{id}/cancel", post(run::cancel_run))
        .route("/api/runs/{id}/artifacts", get(run::list_artifacts))
        .route(
            "/api/runs/{id}/artifacts/{stage}/{name}",
            get(run::download_artifact),
        )
        // Approval endpoints
        .route(
            "/api/runs/{id}/gates/{stage}/decision",
            post(approval::decide_gate),
        )
        // Add state and middleware
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use gantry_core::GrantSet;
    use gantry_core::domain::run::{PipelineRun, RunStatus};

    use crate::artifact::MemoryArtifactStore;
    use crate::executor::{
        EnvironmentError, ExecutionEnvironment, ExecutionOutcome, ExecutionRequest, StageExecutor,
    };
    use crate::store::MemoryStore;

    const DEFINITION: &str = r#"
        return pipeline.define({
            name = "api-app",
            branch = "main",
            stages = {
                pipeline.build({
                    name = "build",
                    image = "alpine:3",
                    inputs = { "source" },
                    outputs = { "image" },
                }),
                pipeline.approval({ name = "approve", approvers = { "alice" } }),
            },
        })
    "#;

    /// Writes the source it was given back as the image
    struct Echo;

    #[async_trait]
    impl ExecutionEnvironment for Echo {
        async fn execute(
            &self,
            request: ExecutionRequest,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, EnvironmentError> {
            let source = request.inputs.get("source").cloned().unwrap_or_default();
            Ok(ExecutionOutcome {
                exit_code: 0,
                logs: Vec::new(),
                outputs: [("image".to_string(), source)].into(),
            })
        }
    }

    fn app() -> (Router, Orchestrator) {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            StageExecutor::new(Arc::new(Echo)),
            GrantSet::default(),
        );
        (create_router(orchestrator.clone()), orchestrator)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_definition_lists_issues() {
        let (app, _) = app();
        let source = r#"
            return pipeline.define({
                name = "broken",
                stages = {
                    pipeline.deploy({ name = "deploy", image = "alpine:3", inputs = { "image" } }),
                },
            })
        "#;

        let response = app
            .oneshot(post_json(
                "/api/definitions",
                serde_json::json!({ "source": source }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["issues"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_approve_and_download() {
        let (app, orchestrator) = app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/definitions",
                serde_json::json!({ "source": DEFINITION }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/trigger",
                serde_json::json!({
                    "definition": "api-app",
                    "branch": "main",
                    "source_ref": "git://api-app@abc",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let run: PipelineRun = serde_json::from_slice(&body_bytes(response).await).unwrap();

        orchestrator
            .wait_until(run.id, |status| status == RunStatus::AwaitingApproval)
            .await
            .unwrap();

        let decision_uri = format!("/api/runs/{}/gates/approve/decision", run.id);
        let response = app
            .clone()
            .oneshot(post_json(
                &decision_uri,
                serde_json::json!({ "decision": "Approve", "actor": "mallory" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(post_json(
                &decision_uri,
                serde_json::json!({ "decision": "Approve", "actor": "alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let finished = orchestrator.wait(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        let response = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}/artifacts/build/image", run.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(run::DIGEST_HEADER));
        assert_eq!(body_bytes(response).await, b"git://api-app@abc");

        let response = app
            .oneshot(get("/api/runs?status=succeeded"))
            .await
            .unwrap();
        let runs = body_json(response).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_branch_mismatch_and_unknown_run() {
        let (app, orchestrator) = app();
        orchestrator.register_source(DEFINITION).await.unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/trigger",
                serde_json::json!({
                    "definition": "api-app",
                    "branch": "feature",
                    "source_ref": "git://api-app@abc",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get(&format!("/api/runs/{}", uuid::Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
