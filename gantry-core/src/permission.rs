//! Permission model
//!
//! A generic allow-list keyed by (identity, action, resource pattern).
//! Grants are additive: an action is allowed when any grant matching the
//! identity covers both the action and the resource. There are no explicit
//! denies; the absence of a match is a deny.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::permission::PermissionGrant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authorization {
    Allow,
    Deny,
}

/// A set of grants evaluated together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSet {
    grants: Vec<PermissionGrant>,
}

impl GrantSet {
    pub fn new(grants: Vec<PermissionGrant>) -> Self {
        Self { grants }
    }

    pub fn grants(&self) -> &[PermissionGrant] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Union of two grant sets
    pub fn merged(&self, other: &GrantSet) -> GrantSet {
        let mut grants = self.grants.clone();
        grants.extend(other.grants.iter().cloned());
        GrantSet { grants }
    }

    pub fn authorize(&self, identity: &str, action: &str, resource: &str) -> Authorization {
        let allowed = self.grants.iter().any(|grant| {
            glob_match(&grant.identity, identity)
                && glob_match(&grant.resource, resource)
                && grant.actions.iter().any(|a| action_matches(a, action))
        });

        if allowed {
            Authorization::Allow
        } else {
            Authorization::Deny
        }
    }
}

/// An executor identity bound to exactly the grants of its stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizer {
    identity: String,
    grants: GrantSet,
}

impl Authorizer {
    pub fn new(identity: impl Into<String>, grants: GrantSet) -> Self {
        Self {
            identity: identity.into(),
            grants,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn grants(&self) -> &GrantSet {
        &self.grants
    }

    pub fn authorize(&self, action: &str, resource: &str) -> Authorization {
        self.grants.authorize(&self.identity, action, resource)
    }

    /// Like [`Authorizer::authorize`] but as a `Result` for `?` call sites
    pub fn check(&self, action: &str, resource: &str) -> Result<(), PermissionDenied> {
        match self.authorize(action, resource) {
            Authorization::Allow => Ok(()),
            Authorization::Deny => Err(PermissionDenied {
                identity: self.identity.clone(),
                action: action.to_string(),
                resource: resource.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("'{identity}' is not allowed to '{action}' on '{resource}'")]
pub struct PermissionDenied {
    pub identity: String,
    pub action: String,
    pub resource: String,
}

fn action_matches(pattern: &str, action: &str) -> bool {
    if pattern == "*" || pattern == action {
        return true;
    }

    match pattern.strip_suffix(":*") {
        Some(service) => action
            .split_once(':')
            .is_some_and(|(action_service, _)| action_service == service),
        None => false,
    }
}

/// Glob match where `*` matches any (possibly empty) run of characters,
/// including `/` and `:`. A pattern that does not compile matches nothing.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob::Pattern::new(pattern).is_ok_and(|pattern| pattern.matches(text))
}

/// Check that `pattern` compiles as a grant pattern
pub fn check_pattern(pattern: &str) -> Result<(), glob::PatternError> {
    glob::Pattern::new(pattern).map(|_| ())
}
