//! Log Repository
//!
//! Handles all database operations related to run logs.

use convoy_core::domain::log::{LogEntry, LogLevel};
use sqlx::PgPool;
use uuid::Uuid;

/// Add log entries for a run
pub async fn add_entries(
    pool: &PgPool,
    run_id: Uuid,
    entries: Vec<LogEntry>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for entry in entries {
        let level_str = level_to_string(entry.level);

        sqlx::query(
            r#"
            INSERT INTO run_logs (run_id, timestamp, level, action_id, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(entry.timestamp)
        .bind(level_str)
        .bind(&entry.action_id)
        .bind(&entry.message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Get all log entries for a run
pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<LogEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT timestamp, level, action_id, message
        FROM run_logs
        WHERE run_id = $1
        ORDER BY timestamp ASC, id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "Debug",
        LogLevel::Info => "Info",
        LogLevel::Warning => "Warning",
        LogLevel::Error => "Error",
    }
}

fn string_to_level(s: &str) -> LogLevel {
    match s {
        "Debug" => LogLevel::Debug,
        "Info" => LogLevel::Info,
        "Warning" => LogLevel::Warning,
        "Error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    action_id: Option<String>,
    message: String,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        let level = string_to_level(&row.level);

        LogEntry {
            timestamp: row.timestamp,
            level,
            action_id: row.action_id,
            message: row.message,
        }
    }
}
