//! Permission grant records

use serde::{Deserialize, Serialize};

/// Action an approver must hold on a gate resource to decide it
pub const APPROVAL_ACTION: &str = "approval:decide";

/// A scoped authorization binding an executor identity to allowed actions
/// on the resources matching `resource`.
///
/// `identity` and `resource` are glob patterns (`*` matches any run of
/// characters). Actions are either exact (`registry:push`), service
/// wildcards (`registry:*`) or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub identity: String,
    pub resource: String,
    pub actions: Vec<String>,
}

impl PermissionGrant {
    pub fn new(
        identity: impl Into<String>,
        resource: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            identity: identity.into(),
            resource: resource.into(),
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Grant applying to whichever executor the owning stage spawns
    pub fn for_stage(
        resource: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::new("*", resource, actions)
    }
}
