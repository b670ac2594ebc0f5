//! Pipeline command handlers
//!
//! Handles registering, validating, listing, viewing and deleting pipelines.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use convoy_core::domain::environment::BranchFallback;
use convoy_core::domain::pipeline::{PipelineDefinition, RegisteredPipeline};
use convoy_core::dto::pipeline::{CreatePipeline, PipelineSummary};

use crate::commands::display::TIME_FORMAT;
use crate::config::Config;
use crate::id_resolver::resolve_pipeline_id;
use crate::types::IdOrPrefix;
use convoy_client::OrchestratorClient;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Register a pipeline from a Lua definition script
    Create {
        /// Path to the pipeline.lua script
        #[arg(short, long)]
        script: String,
    },
    /// Parse and validate a definition script without registering it
    Validate {
        /// Path to the pipeline.lua script
        #[arg(short, long)]
        script: String,
    },
    /// List all pipelines
    List,
    /// Get pipeline details
    Get {
        /// Pipeline ID or unambiguous prefix
        id: String,

        /// Also print the definition script
        #[arg(long)]
        script: bool,
    },
    /// Delete a pipeline and its runs
    Delete {
        /// Pipeline ID or unambiguous prefix
        id: String,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        PipelineCommands::Create { script } => create_pipeline(&client, &script).await,
        PipelineCommands::Validate { script } => validate_pipeline(&script),
        PipelineCommands::List => list_pipelines(&client).await,
        PipelineCommands::Get { id, script } => get_pipeline(&client, &id, script).await,
        PipelineCommands::Delete { id } => delete_pipeline(&client, &id).await,
    }
}

/// Reads a definition script from disk
pub fn read_script(script_path: &str) -> Result<String> {
    std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script file: {}", script_path))
}

/// Register a pipeline
///
/// The script is validated locally first so mistakes are reported without a
/// round trip; the orchestrator validates it again on registration.
async fn create_pipeline(client: &OrchestratorClient, script_path: &str) -> Result<()> {
    let script = read_script(script_path)?;

    convoy_lua::parse_pipeline_definition(&script)
        .context("Pipeline definition is invalid")?;

    let pipeline = client.create_pipeline(CreatePipeline { script }).await?;

    println!("{}", "✓ Pipeline registered successfully!".green().bold());
    println!("  ID:      {}", pipeline.id.to_string().cyan());
    print_definition(&pipeline.definition);

    Ok(())
}

/// Validate a definition script locally
fn validate_pipeline(script_path: &str) -> Result<()> {
    let script = read_script(script_path)?;

    let definition = convoy_lua::parse_pipeline_definition(&script)
        .context("Pipeline definition is invalid")?;

    println!("{}", "✓ Pipeline definition is valid".green().bold());
    print_definition(&definition);

    Ok(())
}

/// List all pipelines
async fn list_pipelines(client: &OrchestratorClient) -> Result<()> {
    let pipelines = client.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

/// Get and display a single pipeline
async fn get_pipeline(client: &OrchestratorClient, id: &str, show_script: bool) -> Result<()> {
    let uuid = resolve_pipeline_id(client, &IdOrPrefix::parse(id)).await?;

    let pipeline = client.get_pipeline(uuid).await?;

    print_pipeline_details(&pipeline, show_script);

    Ok(())
}

/// Delete a pipeline
async fn delete_pipeline(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_pipeline_id(client, &IdOrPrefix::parse(id)).await?;

    client.delete_pipeline(uuid).await?;

    println!(
        "{}",
        format!("✓ Pipeline {} deleted successfully!", uuid)
            .green()
            .bold()
    );

    Ok(())
}

/// Print a pipeline summary
fn print_pipeline_summary(pipeline: &PipelineSummary) {
    println!("  {} {}", "▸".cyan(), pipeline.name.bold());
    println!("    ID:           {}", pipeline.id.to_string().dimmed());
    println!("    Service:      {}", pipeline.service);
    println!("    Stages:       {}", pipeline.stage_count);
    if !pipeline.environments.is_empty() {
        println!(
            "    Environments: {}",
            pipeline.environments.join(", ").dimmed()
        );
    }
    println!(
        "    Created:      {}",
        pipeline
            .created_at
            .format(TIME_FORMAT)
            .to_string()
            .dimmed()
    );
    if let Some(desc) = &pipeline.description {
        println!("    Description:  {}", desc.dimmed());
    }
    println!();
}

/// Print detailed pipeline information
fn print_pipeline_details(pipeline: &RegisteredPipeline, show_script: bool) {
    println!("{}", "Pipeline Details:".bold());
    println!("  ID:      {}", pipeline.id.to_string().cyan());
    print_definition(&pipeline.definition);
    println!("  Created: {}", pipeline.created_at.format(TIME_FORMAT));
    println!("  Updated: {}", pipeline.updated_at.format(TIME_FORMAT));

    if show_script {
        println!("\n{}", "Script:".bold());
        println!("{}", "─".repeat(80).dimmed());
        println!("{}", pipeline.script);
        println!("{}", "─".repeat(80).dimmed());
    }
}

/// Print the parsed topology of a definition
fn print_definition(definition: &PipelineDefinition) {
    println!("  Name:    {}", definition.name.bold());
    println!("  Service: {}", definition.service);
    println!("  Source:  {}", definition.source.repository.dimmed());
    if let Some(desc) = &definition.description {
        println!("  Description: {}", desc);
    }

    println!("\n{}", "Environments:".bold());
    for name in definition.environments.names() {
        match definition.environments.resolve(name) {
            Ok(env) => println!(
                "  {} branch {} ({}-{} tasks, desired {})",
                name.cyan(),
                env.branch,
                env.runtime.min_capacity,
                env.runtime.max_capacity,
                env.runtime.desired_count
            ),
            Err(e) => println!("  {} {}", name.cyan(), e.to_string().red()),
        }
    }
    let fallback = match definition.environments.fallback() {
        BranchFallback::EnvironmentName => "branch named after the environment",
        BranchFallback::Reject => "rejected",
    };
    println!("  {} {}", "other environments:".dimmed(), fallback.dimmed());

    println!("\n{}", "Stages:".bold());
    for stage in &definition.stages {
        println!("  {}. {}", stage.ordinal, stage.name.bold());
        for action in &stage.actions {
            let inputs = action
                .inputs
                .iter()
                .map(|input| input.to_string())
                .collect::<Vec<_>>();
            println!(
                "      {} {}{}",
                format!("[{}]", action.kind()).dimmed(),
                action.id,
                if inputs.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", inputs.join(", ")).dimmed().to_string()
                }
            );
        }
    }
}
