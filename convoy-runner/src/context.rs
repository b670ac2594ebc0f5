//! Execution context for pipeline runs
//!
//! Contains the per-run state shared by the sequencer and every action:
//! - Run identity and workspace path
//! - Log buffer for user-visible run logs
//! - Abort signal raised when the run is cancelled

use convoy_core::domain::log::{LogEntry, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::log_buffer::{InMemoryLogBuffer, LogBufferService};

/// Cancellation flag shared between a run and whoever may cancel it
///
/// Raising it stops not-yet-started actions and stages; actions already in
/// flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run execution context
pub struct RunContext {
    pub run_id: Uuid,

    /// Workspace directory of this run; source is checked out below it
    pub workspace: PathBuf,

    logs: Arc<dyn LogBufferService>,

    abort: AbortSignal,
}

impl RunContext {
    /// Creates a new run context
    ///
    /// # Arguments
    /// * `run_id` - The run ID
    /// * `workspace_base` - Base directory for workspaces; the run gets `<base>/<run_id>`
    /// * `logs` - Buffer the run writes its log lines into
    /// * `abort` - Signal the run observes for cancellation
    pub fn new(
        run_id: Uuid,
        workspace_base: PathBuf,
        logs: Arc<dyn LogBufferService>,
        abort: AbortSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            workspace: workspace_base.join(run_id.to_string()),
            logs,
            abort,
        })
    }

    /// Context with a private log buffer and abort signal
    pub fn standalone(run_id: Uuid, workspace_base: PathBuf) -> Arc<Self> {
        Self::new(
            run_id,
            workspace_base,
            Arc::new(InMemoryLogBuffer::new()),
            AbortSignal::new(),
        )
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    /// Drains buffered log entries
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        self.logs.drain()
    }

    pub fn log(&self, level: LogLevel, action_id: Option<&str>, message: impl Into<String>) {
        self.logs.add_entry(LogEntry::new(level, action_id, message));
    }

    pub fn log_info(&self, action_id: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Info, action_id, message);
    }

    pub fn log_warning(&self, action_id: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Warning, action_id, message);
    }

    pub fn log_error(&self, action_id: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Error, action_id, message);
    }

    /// Logs command output line by line at debug level
    pub fn log_output(&self, action_id: &str, output: &str) {
        for line in output.lines().filter(|line| !line.trim().is_empty()) {
            self.log(LogLevel::Debug, Some(action_id), line);
        }
    }
}
