//! Service runtime command handlers
//!
//! Shows the runtimes hosted by the orchestrator and feeds utilization
//! samples to their autoscaling policies.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use colored::*;
use convoy_core::domain::runtime::{
    MetricDimension, RolloutPhase, RuntimeSnapshot, ScalingDecision, ScalingOutcome,
};

use crate::config::Config;
use convoy_client::OrchestratorClient;

/// Service subcommands
#[derive(Subcommand)]
pub enum ServiceCommands {
    /// List service runtimes
    List,
    /// Show one runtime
    Get {
        service: String,
        environment: String,
    },
    /// Report a utilization sample to a runtime's autoscaling policy
    Metric {
        service: String,
        environment: String,

        /// Resource dimension of the sample
        #[arg(short, long, value_enum)]
        dimension: Dimension,

        /// Utilization in percent of allocated capacity
        #[arg(short, long)]
        utilization: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Dimension {
    Cpu,
    Memory,
}

impl From<Dimension> for MetricDimension {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Cpu => MetricDimension::Cpu,
            Dimension::Memory => MetricDimension::Memory,
        }
    }
}

/// Handle service commands
pub async fn handle_service_command(command: ServiceCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        ServiceCommands::List => list_services(&client).await,
        ServiceCommands::Get {
            service,
            environment,
        } => get_service(&client, &service, &environment).await,
        ServiceCommands::Metric {
            service,
            environment,
            dimension,
            utilization,
        } => observe_metric(&client, &service, &environment, dimension, utilization).await,
    }
}

async fn list_services(client: &OrchestratorClient) -> Result<()> {
    let runtimes = client.list_services().await?;

    if runtimes.is_empty() {
        println!("{}", "No service runtimes yet.".yellow());
    } else {
        println!("{}", format!("Found {} runtime(s):", runtimes.len()).bold());
        println!();
        for runtime in runtimes {
            println!(
                "  {} {}/{} {} {}/{} tasks",
                "▸".cyan(),
                runtime.service.bold(),
                runtime.environment,
                colorize_phase(runtime.phase),
                runtime.running_tasks,
                runtime.desired_count
            );
        }
    }

    Ok(())
}

async fn get_service(client: &OrchestratorClient, service: &str, environment: &str) -> Result<()> {
    let runtime = client.get_service(service, environment).await?;

    print_runtime_details(&runtime);

    Ok(())
}

async fn observe_metric(
    client: &OrchestratorClient,
    service: &str,
    environment: &str,
    dimension: Dimension,
    utilization: f64,
) -> Result<()> {
    let decision = client
        .observe_metric(service, environment, dimension.into(), utilization)
        .await?;

    println!("{}", describe_decision(&decision));
    if let Some(cpu) = decision.cpu_recommendation {
        println!("  CPU recommends:    {}", cpu);
    }
    if let Some(memory) = decision.memory_recommendation {
        println!("  Memory recommends: {}", memory);
    }

    Ok(())
}

fn print_runtime_details(runtime: &RuntimeSnapshot) {
    println!("{}", "Service Runtime:".bold());
    println!("  Service:       {}", runtime.service.bold());
    println!("  Environment:   {}", runtime.environment.cyan());
    println!("  Phase:         {}", colorize_phase(runtime.phase));
    println!(
        "  Image:         {}",
        runtime.current_image.as_deref().unwrap_or("none").dimmed()
    );
    println!(
        "  Tasks:         {} running, {} desired",
        runtime.running_tasks, runtime.desired_count
    );
    println!(
        "  Capacity:      {} to {}",
        runtime.min_capacity, runtime.max_capacity
    );
    println!(
        "  Targets:       cpu {}%, memory {}%",
        runtime.cpu_target, runtime.memory_target
    );
}

fn colorize_phase(phase: RolloutPhase) -> ColoredString {
    let name = phase.to_string();
    match phase {
        RolloutPhase::Stable | RolloutPhase::Healthy => name.green(),
        RolloutPhase::RollingOut => name.cyan(),
        RolloutPhase::RollingBack => name.yellow(),
        RolloutPhase::Failed => name.red().bold(),
    }
}

fn describe_decision(decision: &ScalingDecision) -> String {
    match decision.outcome {
        ScalingOutcome::ScaledUp => format!(
            "Scaled up from {} to {} tasks",
            decision.previous, decision.desired
        ),
        ScalingOutcome::ScaledDown => format!(
            "Scaled down from {} to {} tasks",
            decision.previous, decision.desired
        ),
        ScalingOutcome::Unchanged => format!("Unchanged at {} tasks", decision.desired),
        ScalingOutcome::CoolingDown => format!(
            "Wants {} tasks but cooling down; staying at {}",
            decision.desired, decision.previous
        ),
        ScalingOutcome::Deferred => format!(
            "Desired count set to {}; tasks follow when the rollout completes",
            decision.desired
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(previous: u32, desired: u32, outcome: ScalingOutcome) -> ScalingDecision {
        ScalingDecision {
            previous,
            desired,
            cpu_recommendation: Some(desired),
            memory_recommendation: None,
            outcome,
        }
    }

    #[test]
    fn test_describe_scale_up() {
        assert_eq!(
            describe_decision(&decision(2, 4, ScalingOutcome::ScaledUp)),
            "Scaled up from 2 to 4 tasks"
        );
    }

    #[test]
    fn test_describe_cooling_down_keeps_previous() {
        let text = describe_decision(&decision(3, 5, ScalingOutcome::CoolingDown));
        assert!(text.contains("staying at 3"));
    }

    #[test]
    fn test_dimension_conversion() {
        assert_eq!(MetricDimension::from(Dimension::Memory), MetricDimension::Memory);
    }
}
