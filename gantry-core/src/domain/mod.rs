//! Core domain types
//!
//! This module contains the core domain structures used across Gantry crates.
//! Definitions are authored by operators, runs are owned by the orchestrator,
//! artifacts by the artifact store.

pub mod approval;
pub mod artifact;
pub mod definition;
pub mod log;
pub mod permission;
pub mod run;
