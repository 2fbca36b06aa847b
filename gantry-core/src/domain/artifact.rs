//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an artifact: the run that created it, the stage that
/// produced it and its declared name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: Uuid,
    pub stage: String,
    pub name: String,
}

impl ArtifactRef {
    pub fn new(run_id: Uuid, stage: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.stage, self.name)
    }
}

/// Stored artifact metadata
///
/// Content lives in the artifact store and is never copied into runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(flatten)]
    pub reference: ArtifactRef,
    /// Hex-encoded sha256 of the content
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}
