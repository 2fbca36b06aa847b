//! Approval gate endpoints

use gantry_core::domain::approval::{ApprovalDecision, Decision};
use gantry_core::dto::approval::DecideRequest;
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Approve or reject the gate of approval stage `stage`
    ///
    /// Deciding an already decided gate returns the original decision.
    pub async fn decide(
        &self,
        run_id: Uuid,
        stage: &str,
        decision: Decision,
        actor: impl Into<String>,
        comment: Option<String>,
    ) -> Result<ApprovalDecision> {
        let req = DecideRequest {
            decision,
            actor: actor.into(),
            comment,
        };
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{}/gates/{}/decision", run_id, stage)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }
}
