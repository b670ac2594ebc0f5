//! Terminal rendering shared by the command handlers

use colored::*;
use convoy_core::domain::failure::Failure;
use convoy_core::domain::log::{LogEntry, LogLevel};
use convoy_core::domain::run::{RunStatus, RunTrail, StepStatus};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Colorize run status for display
pub fn colorize_run_status(status: RunStatus) -> ColoredString {
    let status_str = format!("{:?}", status);
    match status {
        RunStatus::Queued => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled => status_str.dimmed(),
    }
}

/// Status marker of a stage or action
pub fn step_marker(status: StepStatus) -> ColoredString {
    match status {
        StepStatus::Pending => "·".dimmed(),
        StepStatus::Running => "▸".cyan(),
        StepStatus::Succeeded => "✓".green(),
        StepStatus::Failed => "✗".red(),
        StepStatus::Skipped => "-".dimmed(),
    }
}

/// Print the stage-by-stage trail of a run
pub fn print_trail(trail: &RunTrail) {
    for stage in &trail.stages {
        println!(
            "  {} {} {}",
            step_marker(stage.status),
            stage.name.bold(),
            format!("({:?})", stage.status).dimmed()
        );
        for action in &stage.actions {
            println!(
                "      {} {} {}",
                step_marker(action.status),
                action.action_id,
                format!("[{}]", action.kind).dimmed()
            );
            if let Some(failure) = &action.failure {
                println!("          {}", failure.message.red());
            }
        }
    }
}

/// Print the cause of a failed or cancelled run
pub fn print_cause(cause: &Failure) {
    println!("\n{}", "Cause:".bold());
    println!("  {}", cause.to_string().red());
    if cause.kind.requires_operator() {
        println!(
            "  {}",
            "Operator intervention required before the service is trusted again"
                .yellow()
                .bold()
        );
    }
}

/// Print a log entry
pub fn print_log_entry(log: &LogEntry) {
    let level_str = log.level.to_string();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    let action = log
        .action_id
        .as_ref()
        .map(|id| format!("{} ", id.magenta()))
        .unwrap_or_default();

    println!(
        "{} [{}] {}{}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        action,
        log.message
    );
}
