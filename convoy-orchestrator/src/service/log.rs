//! Log Service
//!
//! Business logic for run log management.

use convoy_core::domain::log::LogEntry;
use sqlx::PgPool;
use uuid::Uuid;

use crate::repository::{log_repository, run_repository};

/// Service error type
#[derive(Debug)]
pub enum LogError {
    RunNotFound(Uuid),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for LogError {
    fn from(err: sqlx::Error) -> Self {
        LogError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Maximum stored length of one message; longer output is cut
const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Persist log entries drained from a run's buffer
pub async fn add_log_entries(pool: &PgPool, run_id: Uuid, entries: Vec<LogEntry>) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let entries: Vec<LogEntry> = entries.into_iter().map(truncate_message).collect();
    let count = entries.len();
    log_repository::add_entries(pool, run_id, entries).await?;

    tracing::debug!("Stored {} log entries for run {}", count, run_id);

    Ok(())
}

/// Get all log entries for a run
pub async fn get_run_logs(pool: &PgPool, run_id: Uuid) -> Result<Vec<LogEntry>> {
    run_repository::find_by_id(pool, run_id)
        .await?
        .ok_or(LogError::RunNotFound(run_id))?;

    let logs = log_repository::find_by_run(pool, run_id).await?;

    Ok(logs)
}

// =============================================================================
// Validation
// =============================================================================

fn truncate_message(mut entry: LogEntry) -> LogEntry {
    if entry.message.len() > MAX_MESSAGE_LENGTH {
        let mut cut = MAX_MESSAGE_LENGTH;
        while !entry.message.is_char_boundary(cut) {
            cut -= 1;
        }
        entry.message.truncate(cut);
        entry.message.push_str(" [truncated]");
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::domain::log::LogLevel;

    #[test]
    fn test_short_message_untouched() {
        let entry = truncate_message(LogEntry::new(LogLevel::Info, None, "built"));
        assert_eq!(entry.message, "built");
    }

    #[test]
    fn test_long_message_truncated_on_char_boundary() {
        let message = format!("{}é", "x".repeat(MAX_MESSAGE_LENGTH - 1));
        let entry = truncate_message(LogEntry::new(LogLevel::Info, Some("image"), message));

        assert!(entry.message.ends_with(" [truncated]"));
        assert!(entry.message.len() <= MAX_MESSAGE_LENGTH + " [truncated]".len());
        assert_eq!(entry.action_id.as_deref(), Some("image"));
    }
}
