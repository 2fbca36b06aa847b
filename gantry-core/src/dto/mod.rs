//! Data Transfer Objects for the orchestrator HTTP API
//!
//! Request and response bodies shared by the orchestrator and its clients.
//! Responses reuse the domain types where the full record is wanted and
//! lighter summaries for listings.

pub mod approval;
pub mod definition;
pub mod run;
