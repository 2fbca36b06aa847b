//! Run command handlers
//!
//! Triggers runs and shows their progress, failures and artifacts.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use gantry_client::{OrchestratorClient, RunQuery};
use gantry_core::domain::log::{LogEntry, LogLevel};
use gantry_core::domain::run::{PipelineRun, RunStatus, StageStatus};
use gantry_core::dto::run::{RunSummary, TriggerRun};

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a run of the latest version of a definition
    Trigger {
        /// Definition name
        definition: String,

        /// Branch the source change landed on
        #[arg(short, long)]
        branch: String,

        /// Reference to the source snapshot (e.g., git://repo@sha)
        #[arg(short, long)]
        source: String,

        /// Source revision
        #[arg(short, long)]
        revision: Option<String>,
    },
    /// List runs
    List {
        /// Only runs of this definition
        #[arg(short, long)]
        definition: Option<String>,

        /// Only runs in this status (running, awaiting_approval, succeeded, failed, cancelled)
        #[arg(long)]
        status: Option<RunStatus>,

        /// Maximum number of runs to show
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show a run with its stages
    Status {
        /// Run ID or unambiguous prefix
        id: String,

        /// Also print captured stage logs
        #[arg(long)]
        logs: bool,

        /// Print the raw run record as JSON
        #[arg(long, conflicts_with = "logs")]
        json: bool,
    },
    /// Cancel a run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// List the artifacts produced by a run
    Artifacts {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Download one artifact
    Download {
        /// Run ID or unambiguous prefix
        id: String,

        /// Producing stage
        stage: String,

        /// Artifact name
        name: String,

        /// Output file, defaults to the artifact name
        #[arg(short, long)]
        output: Option<String>,
    },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunCommands::Trigger {
            definition,
            branch,
            source,
            revision,
        } => {
            let req = TriggerRun {
                definition,
                branch,
                revision,
                source_ref: source,
            };
            trigger_run(&client, req).await
        }
        RunCommands::List {
            definition,
            status,
            limit,
        } => {
            let query = RunQuery {
                definition,
                status,
                limit,
            };
            list_runs(&client, &query).await
        }
        RunCommands::Status { id, logs, json } => show_run(&client, &id, logs, json).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
        RunCommands::Artifacts { id } => list_artifacts(&client, &id).await,
        RunCommands::Download {
            id,
            stage,
            name,
            output,
        } => download_artifact(&client, &id, &stage, &name, output).await,
    }
}

async fn trigger_run(client: &OrchestratorClient, req: TriggerRun) -> Result<()> {
    let run = client.trigger(req).await?;

    println!("{}", "✓ Run started".green().bold());
    println!("  Run ID:     {}", run.id.to_string().cyan());
    println!(
        "  Definition: {} v{}",
        run.definition.name, run.definition.version
    );
    println!("  Source:     {}", run.trigger.source_ref.dimmed());
    println!(
        "\n{}",
        format!("Follow it with: gantry run status {}", run.id).dimmed()
    );

    Ok(())
}

async fn list_runs(client: &OrchestratorClient, query: &RunQuery) -> Result<()> {
    let runs = client.list_runs(query).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", runs.len()).bold());
    println!();
    for run in runs {
        print_run_summary(&run);
    }

    Ok(())
}

async fn show_run(client: &OrchestratorClient, id: &str, logs: bool, json: bool) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.get_run(uuid).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_details(&run, logs);
    }

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.cancel_run(uuid).await?;

    println!(
        "{} Run {} is {}",
        "✓".green(),
        run.id.to_string().cyan(),
        colorize_status(run.status)
    );

    Ok(())
}

async fn list_artifacts(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let artifacts = client.list_artifacts(uuid).await?;

    if artifacts.is_empty() {
        println!("{}", format!("No artifacts for run {}.", uuid).yellow());
        return Ok(());
    }

    println!("{}", format!("Artifacts of run {}:", uuid).bold());
    for artifact in artifacts {
        println!(
            "  {} {}/{}  {} bytes  {}",
            "▸".cyan(),
            artifact.reference.stage,
            artifact.reference.name.bold(),
            artifact.size,
            artifact.digest.chars().take(12).collect::<String>().dimmed()
        );
    }

    Ok(())
}

async fn download_artifact(
    client: &OrchestratorClient,
    id: &str,
    stage: &str,
    name: &str,
    output: Option<String>,
) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let content = client.download_artifact(uuid, stage, name).await?;

    let path = output.unwrap_or_else(|| name.to_string());
    std::fs::write(&path, &content).with_context(|| format!("Failed to write {}", path))?;

    println!(
        "{} Wrote {} bytes to {}",
        "✓".green(),
        content.len(),
        path.bold()
    );

    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().dimmed());
    println!("    Definition: {} v{}", run.definition, run.version);
    println!("    Status:     {}", colorize_status(run.status));
    if !run.status.is_terminal() {
        if let Some(stage) = &run.current_stage {
            println!("    Stage:      {}", stage);
        }
    }
    if let Some(failure) = &run.failure {
        println!(
            "    Failure:    {} at {}",
            failure.kind.as_str().red(),
            failure.stage
        );
    }
    println!(
        "    Created:    {}",
        run.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_details(run: &PipelineRun, logs: bool) {
    println!("{}", "Run Details:".bold());
    println!("  ID:         {}", run.id.to_string().cyan());
    println!(
        "  Definition: {} v{}",
        run.definition.name, run.definition.version
    );
    println!("  Status:     {}", colorize_status(run.status));
    println!("  Branch:     {}", run.trigger.branch);
    if let Some(revision) = &run.trigger.revision {
        println!("  Revision:   {}", revision);
    }
    println!("  Created:    {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = run.finished_at {
        let duration = finished.signed_duration_since(run.created_at);
        println!("  Finished:   {}", finished.format("%Y-%m-%d %H:%M:%S"));
        println!("  Duration:   {}s", duration.num_seconds());
    }

    println!("\n{}", "Stages:".bold());
    for stage in &run.stages {
        let status = match stage.status {
            StageStatus::Succeeded => "✓".green(),
            StageStatus::Failed => "✗".red(),
            StageStatus::Running => "▶".cyan(),
            StageStatus::AwaitingApproval => "⏸".yellow(),
            StageStatus::Cancelled => "■".dimmed(),
            StageStatus::Pending | StageStatus::Skipped => "·".dimmed(),
        };
        let attempts = if stage.attempts > 1 {
            format!(" ({} attempts)", stage.attempts)
        } else {
            String::new()
        };
        println!(
            "  {} {} [{}]{}",
            status,
            stage.name.bold(),
            stage.kind,
            attempts.dimmed()
        );
        if let Some(error) = &stage.error {
            println!("      {}: {}", error.kind.as_str().red(), error.message);
        }
        if logs {
            for entry in &stage.logs {
                print_log_entry(entry);
            }
        }
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        println!("  Stage:   {}", failure.stage);
        println!("  Kind:    {}", failure.kind.as_str().red());
        println!("  Message: {}", failure.message);
    }

    if !run.artifacts.is_empty() {
        println!("\n{}", "Artifacts:".bold());
        for artifact in &run.artifacts {
            println!("  {}/{}", artifact.stage, artifact.name.cyan());
        }
    }
}

fn print_log_entry(log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "      {} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        log.message
    );
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        RunStatus::Running => status_str.cyan(),
        RunStatus::AwaitingApproval => status_str.yellow(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled => status_str.dimmed(),
    }
}
