//! Run command handlers
//!
//! Handles queueing runs on the orchestrator, inspecting them, following
//! their logs, cancelling them, and executing a pipeline locally.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use convoy_core::domain::pipeline::Pipeline;
use convoy_core::domain::run::{PipelineRun, RunEvent, StepStatus};
use convoy_core::dto::run::{CreateRun, RunSummary};
use convoy_runner::runtime::{LocalProvisioner, PodmanTaskPlatform, RuntimeRegistry};
use convoy_runner::{
    ChainedSecretStore, Engine, EnvSecretStore, GitSource, InMemoryMigrationLock,
    InMemorySecretStore, PodmanEnvironment, RunContext, RunnerConfig, SecretStore, Sequencer,
    check_podman_available,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::commands::display::{
    TIME_FORMAT, colorize_run_status, print_cause, print_log_entry, print_trail, step_marker,
};
use crate::commands::pipeline::read_script;
use crate::config::Config;
use crate::id_resolver::{resolve_pipeline_id, resolve_run_id};
use crate::types::IdOrPrefix;
use convoy_client::OrchestratorClient;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Queue a run of a registered pipeline
    Queue {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,

        /// Target environment
        #[arg(short, long)]
        environment: String,
    },
    /// List runs, newest first
    List {
        /// Only runs of this pipeline (ID or unambiguous prefix)
        #[arg(short, long)]
        pipeline: Option<String>,
    },
    /// Get run details with the stage trail
    Get {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Get run logs
    Logs {
        /// Run ID or unambiguous prefix
        id: String,

        /// Keep printing new entries until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a queued or running run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Execute a pipeline script on this machine, without an orchestrator
    Local {
        /// Path to the pipeline.lua script
        #[arg(short, long)]
        script: String,

        /// Target environment
        #[arg(short, long)]
        environment: String,

        /// Directory for run workspaces
        #[arg(long, env = "WORKSPACE_BASE")]
        workspace: Option<PathBuf>,
    },
}

/// Handle run commands
pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RunCommands::Queue {
            pipeline,
            environment,
        } => queue_run(&client, &pipeline, environment).await,
        RunCommands::List { pipeline } => list_runs(&client, pipeline.as_deref()).await,
        RunCommands::Get { id } => get_run(&client, &id).await,
        RunCommands::Logs { id, follow } => get_run_logs(&client, &id, follow).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
        RunCommands::Local {
            script,
            environment,
            workspace,
        } => run_local(&script, &environment, workspace).await,
    }
}

// =============================================================================
// Orchestrator Runs
// =============================================================================

/// Queue a run
async fn queue_run(client: &OrchestratorClient, pipeline: &str, environment: String) -> Result<()> {
    let pipeline_id = resolve_pipeline_id(client, &IdOrPrefix::parse(pipeline)).await?;

    let run = client
        .queue_run(pipeline_id, CreateRun { environment })
        .await?;

    println!("{}", "✓ Run queued successfully!".green().bold());
    println!("  Run ID:      {}", run.id.to_string().cyan());
    println!("  Pipeline ID: {}", run.pipeline_id.to_string().dimmed());
    println!("  Environment: {}", run.environment.bold());
    println!("  Branch:      {}", run.branch);
    println!("  Status:      {}", colorize_run_status(run.status));

    Ok(())
}

/// List runs
async fn list_runs(client: &OrchestratorClient, pipeline: Option<&str>) -> Result<()> {
    let pipeline_id = match pipeline {
        Some(prefix) => Some(resolve_pipeline_id(client, &IdOrPrefix::parse(prefix)).await?),
        None => None,
    };

    let runs = client.list_runs(pipeline_id).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

/// Get and display a single run
async fn get_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    let run = client.get_run(uuid).await?;

    print_run_details(&run);

    Ok(())
}

/// Get and display run logs
async fn get_run_logs(client: &OrchestratorClient, id: &str, follow: bool) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    let mut printed = 0;
    loop {
        let logs = client.get_run_logs(uuid).await?;
        for log in logs.iter().skip(printed) {
            print_log_entry(log);
        }
        printed = printed.max(logs.len());

        if !follow {
            if logs.is_empty() {
                println!("{}", "No logs found for this run.".yellow());
            }
            return Ok(());
        }

        let run = client.get_run(uuid).await?;
        if run.status.is_terminal() {
            // Logs flushed after the status change are picked up here
            let logs = client.get_run_logs(uuid).await?;
            for log in logs.iter().skip(printed) {
                print_log_entry(log);
            }
            println!(
                "\n{} {}",
                "Run finished:".bold(),
                colorize_run_status(run.status)
            );
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Cancel a run
async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    let run = client.cancel_run(uuid).await?;

    println!(
        "{}",
        format!("✓ Cancellation of run {} requested", uuid)
            .green()
            .bold()
    );
    println!("  Status: {}", colorize_run_status(run.status));

    Ok(())
}

/// Print a run summary
fn print_run_summary(run: &RunSummary) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        run.id.to_string().bold(),
        colorize_run_status(run.status)
    );
    println!("    Pipeline:    {}", run.pipeline_id.to_string().dimmed());
    println!("    Environment: {} ({})", run.environment, run.branch.dimmed());
    println!(
        "    Requested:   {}",
        run.requested_at.format(TIME_FORMAT).to_string().dimmed()
    );
    if let Some(cause) = &run.cause {
        println!("    Cause:       {}", cause.kind.to_string().red());
    }
    println!();
}

/// Print detailed run information
fn print_run_details(run: &PipelineRun) {
    println!("{}", "Run Details:".bold());
    println!("  ID:          {}", run.id.to_string().cyan());
    println!("  Pipeline ID: {}", run.pipeline_id.to_string().dimmed());
    println!("  Environment: {}", run.environment.bold());
    println!("  Branch:      {}", run.branch);
    println!("  Status:      {}", colorize_run_status(run.status));
    if let Some(revision) = &run.revision {
        println!("  Revision:    {}", revision);
    }
    println!("  Requested:   {}", run.requested_at.format(TIME_FORMAT));

    if let Some(started) = run.started_at {
        println!("  Started:     {}", started.format(TIME_FORMAT));
    }

    if let Some(completed) = run.completed_at {
        println!("  Completed:   {}", completed.format(TIME_FORMAT));

        if let Some(started) = run.started_at {
            let duration = completed.signed_duration_since(started);
            println!("  Duration:    {}s", duration.num_seconds());
        }
    }

    println!("\n{}", "Stages:".bold());
    print_trail(&run.trail);

    if let Some(cause) = &run.cause {
        print_cause(cause);
    }
}

// =============================================================================
// Local Runs
// =============================================================================

/// Execute a pipeline on this machine
///
/// Uses the same engine as the orchestrator with process-local collaborators:
/// an in-memory migration lock and secrets from the environment. Ctrl-C
/// cancels the run.
async fn run_local(script_path: &str, environment: &str, workspace: Option<PathBuf>) -> Result<()> {
    let script = read_script(script_path)?;
    let definition = convoy_lua::parse_pipeline_definition(&script)
        .context("Pipeline definition is invalid")?;
    let pipeline = definition
        .instantiate(environment)
        .with_context(|| format!("Pipeline cannot run against '{}'", environment))?;

    let mut runner_config = RunnerConfig::from_env().context("Failed to load runner configuration")?;
    if let Some(workspace) = workspace {
        runner_config.workspace_base = workspace;
    }
    runner_config.validate().context("Invalid runner configuration")?;

    check_podman_available()
        .await
        .context("Local runs execute actions in podman containers")?;

    let provisioned = Arc::new(InMemorySecretStore::new());
    let secrets: Arc<dyn SecretStore> = Arc::new(ChainedSecretStore::new(vec![
        Arc::new(EnvSecretStore::new()),
        Arc::clone(&provisioned) as Arc<dyn SecretStore>,
    ]));
    let provisioner = LocalProvisioner::new(
        Arc::new(PodmanTaskPlatform::new()),
        runner_config.runtime_settings(),
        runner_config.autoscaling_settings(),
        provisioned,
    );
    let engine = Engine::new(
        Arc::new(GitSource::new()),
        Arc::new(PodmanEnvironment::new()),
        Arc::new(InMemoryMigrationLock::new()),
        secrets,
        Arc::new(RuntimeRegistry::new(Arc::new(provisioner))),
    );

    let context = RunContext::standalone(Uuid::new_v4(), runner_config.workspace_base.clone());

    println!(
        "{} {} against {} (branch {})",
        "Running".green().bold(),
        pipeline.name().bold(),
        pipeline.environment().name.cyan(),
        pipeline.branch()
    );

    let abort = context.abort_signal().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Cancelling run...".yellow());
            abort.raise();
        }
    });

    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_progress(
        pipeline.clone(),
        Arc::clone(&context),
        rx,
    ));

    let sequencer = Sequencer::new(engine, runner_config).with_event_channel(tx);
    let result = sequencer.run(&context, &pipeline).await;
    drop(sequencer);

    printer.await.ok();
    interrupt.abort();

    if let Err(e) = tokio::fs::remove_dir_all(&context.workspace).await {
        tracing::debug!("Workspace {:?} not removed: {}", context.workspace, e);
    }

    println!();
    println!("{} {}", "Run finished:".bold(), colorize_run_status(result.status));
    if let Some(revision) = &result.revision {
        println!("  Revision: {}", revision);
    }
    print_trail(&result.trail);

    if let Some(cause) = &result.cause {
        print_cause(cause);
    }

    if !result.succeeded() {
        bail!("Run did not succeed");
    }

    Ok(())
}

/// Prints run events and buffered logs until the event channel closes
async fn print_progress(
    pipeline: Pipeline,
    context: Arc<RunContext>,
    mut events: mpsc::Receiver<RunEvent>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            event = events.recv() => {
                for log in context.drain_logs() {
                    print_log_entry(&log);
                }
                match event {
                    Some(event) => println!("{}", describe_event(&pipeline, &event)),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                for log in context.drain_logs() {
                    print_log_entry(&log);
                }
            }
        }
    }

    for log in context.drain_logs() {
        print_log_entry(&log);
    }
}

/// One-line description of a progress event
fn describe_event(pipeline: &Pipeline, event: &RunEvent) -> String {
    let stage_name = |ordinal: u32| {
        pipeline
            .stages()
            .get(ordinal as usize)
            .map(|stage| stage.name.as_str())
            .unwrap_or("?")
    };

    match event {
        RunEvent::SourceRetrieved { revision } => {
            format!("{} source at {}", "▸".cyan(), revision.bold())
        }
        RunEvent::StageStarted { ordinal } => {
            format!("{} stage {}", "▸".cyan(), stage_name(*ordinal).bold())
        }
        RunEvent::ActionStarted { ordinal, action_id } => {
            format!("    {} {}/{}", "▸".cyan(), stage_name(*ordinal), action_id)
        }
        RunEvent::ActionFinished { ordinal, report } => {
            let mut line = format!(
                "    {} {}/{}",
                step_marker(report.status),
                stage_name(*ordinal),
                report.action_id
            );
            if let Some(failure) = &report.failure {
                line.push_str(&format!(" {}", failure.to_string().red()));
            }
            line
        }
        RunEvent::StageFinished { report } => {
            let status = match report.status {
                StepStatus::Succeeded => "done".green(),
                StepStatus::Failed => "failed".red(),
                other => format!("{:?}", other).to_lowercase().dimmed(),
            };
            format!("{} stage {} {}", step_marker(report.status), report.name.bold(), status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
        return pipeline.define {
            name = "svc-deploy",
            service = "svc",
            source = { repository = "https://git.example.com/svc.git" },
            environments = { prod = { branch = "main" } },
            stages = {
                pipeline.stage {
                    name = "build",
                    actions = {
                        pipeline.build {
                            id = "image",
                            commands = { "make test" },
                            outputs = { image = "image-ref" },
                            image = { repository = "registry/svc" },
                        },
                    },
                },
                pipeline.stage {
                    name = "deploy",
                    actions = { pipeline.deploy { id = "rollout", image = "build/image" } },
                },
            },
        }
    "#;

    fn pipeline() -> Pipeline {
        convoy_lua::parse_pipeline_definition(SCRIPT)
            .unwrap()
            .instantiate("prod")
            .unwrap()
    }

    #[test]
    fn test_describe_event_names_stage_and_action() {
        colored::control::set_override(false);
        let pipeline = pipeline();

        let started = describe_event(
            &pipeline,
            &RunEvent::ActionStarted {
                ordinal: 1,
                action_id: "rollout".to_string(),
            },
        );
        assert!(started.contains("deploy/rollout"));

        let stage = describe_event(&pipeline, &RunEvent::StageStarted { ordinal: 0 });
        assert!(stage.contains("stage build"));
    }

    #[test]
    fn test_describe_event_unknown_ordinal() {
        colored::control::set_override(false);
        let line = describe_event(&pipeline(), &RunEvent::StageStarted { ordinal: 9 });
        assert!(line.contains("stage ?"));
    }

    #[test]
    fn test_instantiate_resolves_mapped_branch() {
        assert_eq!(pipeline().branch(), "main");
    }
}
