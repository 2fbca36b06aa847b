//! Definition registry endpoints

use gantry_core::domain::definition::PipelineDefinition;
use gantry_core::dto::definition::{DefinitionSummary, RegisterDefinition};
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Register Lua definition source as a new definition version
    ///
    /// A rejected definition comes back as an API error carrying every
    /// validation issue.
    pub async fn register_definition(&self, source: impl Into<String>) -> Result<PipelineDefinition> {
        let req = RegisterDefinition {
            source: source.into(),
        };
        let response = self
            .client
            .post(self.url("/api/definitions"))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List every registered definition version
    pub async fn list_definitions(&self) -> Result<Vec<DefinitionSummary>> {
        let response = self.client.get(self.url("/api/definitions")).send().await?;

        self.handle_response(response).await
    }

    /// Get one definition version by ID
    pub async fn get_definition(&self, id: Uuid) -> Result<PipelineDefinition> {
        let response = self
            .client
            .get(self.url(&format!("/api/definitions/{}", id)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
