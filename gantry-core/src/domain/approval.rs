//! Approval gate domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor recorded when a gate expires without a human decision
pub const EXPIRY_ACTOR: &str = "gantry";

/// A gate is addressed by its run and the approval stage it guards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateId {
    pub run_id: Uuid,
    pub stage: String,
}

impl GateId {
    pub fn new(run_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
        }
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approve,
    Reject,
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

/// Gate state machine: `Pending -> {Approved, Rejected}`, both terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Pending,
    Approved,
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    Decision,
    Expired,
}

/// The single recorded decision of a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub gate: GateId,
    pub decision: Decision,
    pub actor: String,
    pub comment: Option<String>,
    /// Set when the decision was produced by the gate timing out
    #[serde(default)]
    pub expired: bool,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn new(gate: GateId, decision: Decision, actor: impl Into<String>) -> Self {
        Self {
            gate,
            decision,
            actor: actor.into(),
            comment: None,
            expired: false,
            decided_at: Utc::now(),
        }
    }

    pub fn expiry(gate: GateId) -> Self {
        Self {
            comment: Some("approval window expired".to_string()),
            expired: true,
            ..Self::new(gate, Decision::Reject, EXPIRY_ACTOR)
        }
    }

    pub fn state(&self) -> GateState {
        match (self.decision, self.expired) {
            (Decision::Approve, _) => GateState::Approved,
            (Decision::Reject, false) => GateState::Rejected(RejectionReason::Decision),
            (Decision::Reject, true) => GateState::Rejected(RejectionReason::Expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_state() {
        let gate = GateId::new(Uuid::new_v4(), "approve");
        let approved = ApprovalDecision::new(gate.clone(), Decision::Approve, "alice");
        assert_eq!(approved.state(), GateState::Approved);

        let rejected = ApprovalDecision::new(gate.clone(), Decision::Reject, "alice");
        assert_eq!(
            rejected.state(),
            GateState::Rejected(RejectionReason::Decision)
        );

        let expired = ApprovalDecision::expiry(gate);
        assert_eq!(expired.actor, EXPIRY_ACTOR);
        assert_eq!(expired.state(), GateState::Rejected(RejectionReason::Expired));
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!("approve".parse::<Decision>(), Ok(Decision::Approve));
        assert_eq!("Reject".parse::<Decision>(), Ok(Decision::Reject));
        assert!("maybe".parse::<Decision>().is_err());
    }
}
