//! CLI configuration

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,
}

impl Config {
    pub fn client(&self) -> gantry_client::OrchestratorClient {
        gantry_client::OrchestratorClient::new(&self.orchestrator_url)
    }
}
