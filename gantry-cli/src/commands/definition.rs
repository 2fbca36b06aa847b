//! Definition command handlers
//!
//! Registers Lua definitions with the orchestrator, checks them locally and
//! shows registered versions.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use gantry_client::{ClientError, OrchestratorClient};
use gantry_core::domain::definition::{PipelineDefinition, StageKind};
use gantry_core::{PipelineGraph, ValidationError};

use crate::config::Config;
use crate::id_resolver::resolve_definition_id;
use crate::types::IdOrPrefix;

/// Definition subcommands
#[derive(Subcommand)]
pub enum DefinitionCommands {
    /// Register a definition script as a new version
    Register {
        /// Path to the Lua definition script
        script: String,
    },
    /// Compile and validate a definition script without registering it
    Check {
        /// Path to the Lua definition script
        script: String,
    },
    /// List registered definition versions
    List,
    /// Show a definition version with its artifact flow
    Show {
        /// Definition ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_definition_command(command: DefinitionCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        DefinitionCommands::Register { script } => register_definition(&client, &script).await,
        DefinitionCommands::Check { script } => check_definition(&script),
        DefinitionCommands::List => list_definitions(&client).await,
        DefinitionCommands::Show { id } => show_definition(&client, &id).await,
    }
}

fn read_script(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read script file: {}", path))
}

/// Register a definition script
///
/// The orchestrator validates the definition again; a rejection lists each
/// problem.
async fn register_definition(client: &OrchestratorClient, script_path: &str) -> Result<()> {
    let source = read_script(script_path)?;

    match client.register_definition(source).await {
        Ok(definition) => {
            println!("{}", "✓ Definition registered".green().bold());
            println!();
            print_definition_details(&definition);
            Ok(())
        }
        Err(ClientError::ApiError { message, issues, .. }) if !issues.is_empty() => {
            println!("{}", format!("✗ {}", message).red().bold());
            for issue in &issues {
                println!("  {} {}", "•".red(), issue);
            }
            anyhow::bail!("definition rejected with {} issue(s)", issues.len())
        }
        Err(e) => Err(e.into()),
    }
}

/// Compile a script locally, reporting every validation issue
fn check_definition(script_path: &str) -> Result<()> {
    let source = read_script(script_path)?;

    match gantry_lua::compile_definition(&source) {
        Ok(definition) => {
            println!(
                "{}",
                format!(
                    "✓ {} is valid ({} stage(s))",
                    definition.name,
                    definition.stages.len()
                )
                .green()
                .bold()
            );
            print_artifact_flow(&definition);
            Ok(())
        }
        Err(e) => {
            if let Some(validation) = e.downcast_ref::<ValidationError>() {
                println!("{}", "✗ Definition is invalid".red().bold());
                for issue in &validation.issues {
                    println!("  {} {}", "•".red(), issue);
                }
                anyhow::bail!("{} validation issue(s)", validation.issues.len())
            }
            Err(e.context(format!("Failed to compile {}", script_path)))
        }
    }
}

async fn list_definitions(client: &OrchestratorClient) -> Result<()> {
    let definitions = client.list_definitions().await?;

    if definitions.is_empty() {
        println!("{}", "No definitions found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} definition version(s):", definitions.len()).bold());
    println!();
    for definition in definitions {
        println!(
            "  {} {} v{} {}",
            "▸".cyan(),
            definition.name.bold(),
            definition.version,
            definition.id.to_string().dimmed()
        );
        println!("    Branch: {}", definition.branch);
        println!("    Stages: {}", definition.stages.join(" → "));
        println!(
            "    Created: {}",
            definition
                .created_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed()
        );
        println!();
    }

    Ok(())
}

async fn show_definition(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_definition_id(client, &IdOrPrefix::parse(id)).await?;
    let definition = client.get_definition(uuid).await?;

    print_definition_details(&definition);
    print_artifact_flow(&definition);

    Ok(())
}

fn print_definition_details(definition: &PipelineDefinition) {
    println!("{}", "Definition:".bold());
    println!("  ID:      {}", definition.id.to_string().cyan());
    println!("  Name:    {}", definition.name);
    println!("  Version: {}", definition.version);
    println!("  Branch:  {}", definition.trigger.branch);
    if let Some(description) = &definition.description {
        println!("  About:   {}", description.dimmed());
    }

    println!("\n{}", "Stages:".bold());
    for (idx, stage) in definition.stages.iter().enumerate() {
        let kind = match stage.kind {
            StageKind::Build => stage.kind.as_str().blue(),
            StageKind::Deploy => stage.kind.as_str().magenta(),
            StageKind::Approval => stage.kind.as_str().yellow(),
        };
        println!("  {}. {} [{}]", idx + 1, stage.name.bold(), kind);

        if let Some(execution) = &stage.execution {
            println!("     image:   {}", execution.image);
            for action in &execution.actions {
                println!("     action:  {} on {}", action.action, action.resource);
            }
        }
        if !stage.outputs.is_empty() {
            println!("     outputs: {}", stage.outputs.join(", "));
        }
        if stage.kind == StageKind::Approval {
            match definition.approval_timeout(stage) {
                Some(seconds) => println!("     expires: after {}s", seconds),
                None => println!("     expires: never"),
            }
        }
        for grant in &stage.grants {
            println!(
                "     grant:   {} may {} on {}",
                grant.identity,
                grant.actions.join(","),
                grant.resource
            );
        }
    }
}

fn print_artifact_flow(definition: &PipelineDefinition) {
    let Ok(graph) = PipelineGraph::build(definition) else {
        return;
    };

    let edges = graph.edges();
    if edges.is_empty() {
        return;
    }

    println!("\n{}", "Artifact flow:".bold());
    for edge in edges {
        println!(
            "  {} ──{}──▶ {}",
            edge.producer,
            edge.artifact.cyan(),
            edge.consumer
        );
    }
}
