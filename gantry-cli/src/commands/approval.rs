//! Approval command handlers

use anyhow::Result;
use clap::Args;
use colored::*;
use gantry_core::domain::approval::{Decision, GateState};

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Identifies the gate being decided and who decides it
#[derive(Args)]
pub struct GateArgs {
    /// Run ID or unambiguous prefix
    pub run: String,

    /// Name of the approval stage
    pub stage: String,

    /// Identity of the person deciding
    #[arg(long, env = "GANTRY_ACTOR")]
    pub actor: String,

    /// Comment stored with the decision
    #[arg(short, long)]
    pub comment: Option<String>,
}

pub async fn decide(args: GateArgs, decision: Decision, config: &Config) -> Result<()> {
    let client = config.client();
    let run_id = resolve_run_id(&client, &IdOrPrefix::parse(&args.run)).await?;

    let recorded = client
        .decide(run_id, &args.stage, decision, args.actor.as_str(), args.comment)
        .await?;

    if recorded.decision != decision || recorded.actor != args.actor {
        println!(
            "{}",
            format!("⚠ Gate {} was already decided", args.stage).yellow()
        );
    }

    let state = match recorded.state() {
        GateState::Approved => "approved".green().bold(),
        GateState::Rejected(_) if recorded.expired => "expired".red().bold(),
        _ => "rejected".red().bold(),
    };
    println!("Gate {} on run {}: {}", args.stage.bold(), run_id.to_string().dimmed(), state);
    println!("  By:      {}", recorded.actor);
    println!(
        "  At:      {}",
        recorded.decided_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(comment) = &recorded.comment {
        println!("  Comment: {}", comment.dimmed());
    }

    Ok(())
}
