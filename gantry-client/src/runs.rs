//! Run endpoints

use gantry_core::domain::artifact::Artifact;
use gantry_core::domain::run::{PipelineRun, RunStatus};
use gantry_core::dto::run::{RunSummary, TriggerRun};
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

/// Filters for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub definition: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

impl RunQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(definition) = &self.definition {
            params.push(("definition", definition.clone()));
        }
        if let Some(status) = self.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

impl OrchestratorClient {
    /// Start a run from a source-change event
    pub async fn trigger(&self, req: TriggerRun) -> Result<PipelineRun> {
        let response = self
            .client
            .post(self.url("/api/trigger"))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunSummary>> {
        let response = self
            .client
            .get(self.url("/api/runs"))
            .query(&query.params())
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Full run record: per-stage status, failure and artifact bindings
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{}/cancel", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}/artifacts", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Download the content of one artifact
    pub async fn download_artifact(&self, run_id: Uuid, stage: &str, name: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}/artifacts/{}/{}", run_id, stage, name)))
            .send()
            .await?;

        self.handle_bytes_response(response).await
    }
}
