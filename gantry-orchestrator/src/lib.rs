//! Gantry Orchestrator
//!
//! Drives pipeline runs through their stages, stores artifacts, gates
//! deployments on approvals and serves the HTTP API.

pub mod api;
pub mod artifact;
pub mod config;
pub mod db;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod registry;
pub mod retention;
pub mod store;

pub use config::Config;
pub use engine::{EngineError, Orchestrator};
