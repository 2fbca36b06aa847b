//! Gantry Lua definition language
//!
//! Pipeline definitions are written as Lua scripts returning
//! `pipeline.define { ... }` and evaluated in a sandbox with no I/O, OS or
//! module loading. This crate provides:
//! - The sandbox and its `pipeline` helper module
//! - Parsing of the returned table into a `PipelineDefinition`
//! - Compilation (parse + graph validation) used by the orchestrator and CLI

pub mod parser;
pub mod sandbox;

pub use parser::{compile_definition, parse_definition};
pub use sandbox::create_sandbox;

pub use gantry_core::domain::definition::{PipelineDefinition, StageKind, StageSpec};
