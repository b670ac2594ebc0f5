//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod display;
mod init;
mod pipeline;
mod run;
mod service;

pub use init::InitCommands;
pub use pipeline::PipelineCommands;
pub use run::RunCommands;
pub use service::ServiceCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Trigger and inspect runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Service runtimes and autoscaling
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
    /// Initialize development environment
    Init {
        #[command(subcommand)]
        command: InitCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Service { command } => service::handle_service_command(command, config).await,
        Commands::Init { command } => init::handle_init_command(command, config).await,
    }
}
