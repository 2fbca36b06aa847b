//! Definition DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::definition::PipelineDefinition;

/// Request to register a definition from Lua source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub source: String,
}

/// One registered definition version, as listed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSummary {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub branch: String,
    pub stages: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&PipelineDefinition> for DefinitionSummary {
    fn from(definition: &PipelineDefinition) -> Self {
        Self {
            id: definition.id,
            name: definition.name.clone(),
            version: definition.version,
            branch: definition.trigger.branch.clone(),
            stages: definition.stages.iter().map(|s| s.name.clone()).collect(),
            created_at: definition.created_at,
        }
    }
}
