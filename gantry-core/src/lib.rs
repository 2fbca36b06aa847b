//! Gantry Core
//!
//! Core types and abstractions for the Gantry deployment pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, runs, artifacts, approvals, grants
//! - DTOs: request/response bodies shared by the orchestrator API and its clients
//! - Graph validation: definition-time checks of the linear stage graph
//! - Permission evaluation: the allow-list model applied to every executor
//!
//! Nothing in here touches the network, the database or the clock beyond
//! stamping timestamps, so both the orchestrator and the CLI can depend on it.

pub mod domain;
pub mod dto;
pub mod error;
pub mod graph;
pub mod permission;

pub use error::{ErrorKind, ValidationError, ValidationIssue};
pub use graph::{ArtifactEdge, PipelineGraph, validate};
pub use permission::{Authorization, Authorizer, GrantSet, PermissionDenied};
