//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod approval;
mod definition;
mod run;

pub use approval::GateArgs;
pub use definition::DefinitionCommands;
pub use run::RunCommands;

use anyhow::Result;
use clap::Subcommand;
use gantry_core::domain::approval::Decision;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline definition management
    Definition {
        #[command(subcommand)]
        command: DefinitionCommands,
    },
    /// Trigger and inspect pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Approve a run waiting at an approval gate
    Approve(GateArgs),
    /// Reject a run waiting at an approval gate
    Reject(GateArgs),
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Definition { command } => {
            definition::handle_definition_command(command, config).await
        }
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Approve(args) => approval::decide(args, Decision::Approve, config).await,
        Commands::Reject(args) => approval::decide(args, Decision::Reject, config).await,
    }
}
