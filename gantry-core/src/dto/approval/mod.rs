//! Approval DTOs

use serde::{Deserialize, Serialize};

use crate::domain::approval::Decision;

/// Decision posted to an approval gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideRequest {
    pub decision: Decision,
    pub actor: String,
    #[serde(default)]
    pub comment: Option<String>,
}
