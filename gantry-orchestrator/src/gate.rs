//! Approval gates
//!
//! A gate blocks its run until an authorized actor approves or rejects it, or
//! until its approval window expires. Exactly one decision is ever recorded
//! per gate: it is written through the [`RunStore`] (first writer wins) and
//! then broadcast to the run waiting on the gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gantry_core::domain::approval::{ApprovalDecision, Decision, GateId};
use gantry_core::domain::definition::StageSpec;
use gantry_core::domain::permission::APPROVAL_ACTION;
use gantry_core::{Authorizer, GrantSet, PermissionDenied};

use crate::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error("gate {0} is not awaiting a decision")]
    NotOpen(GateId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct Gate {
    decision: watch::Sender<Option<ApprovalDecision>>,
    /// Serializes the check-then-record of a decision
    decide_lock: tokio::sync::Mutex<()>,
    deadline: Option<DateTime<Utc>>,
}

/// A gate opened by a run, to be waited on
pub struct GateHandle {
    id: GateId,
    gate: Arc<Gate>,
}

impl GateHandle {
    pub fn id(&self) -> &GateId {
        &self.id
    }
}

pub struct ApprovalGates {
    store: Arc<dyn RunStore>,
    approvers: GrantSet,
    gates: Mutex<HashMap<GateId, Arc<Gate>>>,
}

impl ApprovalGates {
    pub fn new(store: Arc<dyn RunStore>, approvers: GrantSet) -> Self {
        Self {
            store,
            approvers,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Open a gate that expires `window_seconds` after `opened_at`.
    ///
    /// The window runs from `opened_at`, so a gate reopened after a restart
    /// keeps its original deadline. A decision persisted before the restart
    /// is picked up immediately.
    pub async fn open(
        &self,
        id: GateId,
        window_seconds: Option<u64>,
        opened_at: DateTime<Utc>,
    ) -> Result<GateHandle, GateError> {
        let persisted = self.store.get_decision(&id).await?;
        let deadline = window_seconds.and_then(|seconds| deadline_after(opened_at, seconds));

        let mut gates = self.gates.lock().map_err(|_| StoreError::poisoned())?;
        let gate = gates
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Gate {
                    decision: watch::Sender::new(None),
                    decide_lock: tokio::sync::Mutex::new(()),
                    deadline,
                })
            })
            .clone();

        if let Some(decision) = persisted {
            gate.decision.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(decision);
                    true
                } else {
                    false
                }
            });
        }

        info!("Gate {} opened", id);
        Ok(GateHandle { id, gate })
    }

    /// Drop the in-memory state of a gate whose run moved on
    pub fn close(&self, id: &GateId) {
        if let Ok(mut gates) = self.gates.lock() {
            gates.remove(id);
        }
    }

    /// Record `actor`'s decision on the gate guarding `stage`.
    ///
    /// The actor must hold `approval:decide` on the gate's resource through
    /// the stage's grants or the operator approvers. Once a gate is decided
    /// every later call returns the recorded decision unchanged.
    pub async fn decide(
        &self,
        id: &GateId,
        stage: &StageSpec,
        decision: Decision,
        actor: &str,
        comment: Option<String>,
    ) -> Result<ApprovalDecision, GateError> {
        let grants = GrantSet::new(stage.grants.clone()).merged(&self.approvers);
        Authorizer::new(actor, grants).check(APPROVAL_ACTION, &stage.gate_resource())?;

        let gate = {
            let gates = self.gates.lock().map_err(|_| StoreError::poisoned())?;
            gates.get(id).cloned()
        };

        let Some(gate) = gate else {
            return self
                .store
                .get_decision(id)
                .await?
                .ok_or_else(|| GateError::NotOpen(id.clone()));
        };

        let _guard = gate.decide_lock.lock().await;
        if let Some(existing) = gate.decision.borrow().clone() {
            return Ok(existing);
        }

        let mut candidate = ApprovalDecision::new(id.clone(), decision, actor);
        candidate.comment = comment;

        let recorded = self.store.record_decision(&candidate).await?;
        info!(
            "Gate {} decided: {:?} by {}",
            id, recorded.decision, recorded.actor
        );
        gate.decision.send_replace(Some(recorded.clone()));

        Ok(recorded)
    }

    /// Wait until the gate is decided or expires.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn wait(
        &self,
        handle: &GateHandle,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let mut decisions = handle.gate.decision.subscribe();

        loop {
            if let Some(decision) = decisions.borrow_and_update().clone() {
                return Some(decision);
            }

            let expiry = async {
                match handle.gate.deadline {
                    Some(deadline) => {
                        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(remaining).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = decisions.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = expiry => return Some(self.expire(handle).await),
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn expire(&self, handle: &GateHandle) -> ApprovalDecision {
        let _guard = handle.gate.decide_lock.lock().await;
        if let Some(existing) = handle.gate.decision.borrow().clone() {
            return existing;
        }

        let expiry = ApprovalDecision::expiry(handle.id.clone());
        let recorded = match self.store.record_decision(&expiry).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("Failed to persist expiry of gate {}: {}", handle.id, e);
                expiry
            }
        };

        info!("Gate {} expired", handle.id);
        handle.gate.decision.send_replace(Some(recorded.clone()));
        recorded
    }
}

/// `None` when the window runs past what a timestamp can represent, in
/// which case the gate waits for an explicit decision.
fn deadline_after(opened_at: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    opened_at.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
}
