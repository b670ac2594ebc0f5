//! Cross-process migration lock
//!
//! Backed by PostgreSQL session-level advisory locks, so two orchestrators
//! sharing a database cannot migrate the same target at once. Each lease owns
//! a dedicated connection: the advisory lock lives exactly as long as that
//! session, and dropping an unreleased lease closes it.
//!
//! A process-local lock sits in front of the advisory lock so conflicts
//! between runs of the same process name the holder.

use async_trait::async_trait;
use convoy_runner::{InMemoryMigrationLock, LockError, MigrationLease, MigrationLock};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, warn};

pub struct PgAdvisoryMigrationLock {
    pool: PgPool,
    local: InMemoryMigrationLock,
}

impl PgAdvisoryMigrationLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            local: InMemoryMigrationLock::new(),
        }
    }
}

#[async_trait]
impl MigrationLock for PgAdvisoryMigrationLock {
    async fn try_acquire(
        &self,
        database: &str,
        holder: &str,
    ) -> Result<Box<dyn MigrationLease>, LockError> {
        let local = self.local.try_acquire(database, holder).await?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?
            .detach();

        let acquired: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(database)
                .fetch_one(&mut conn)
                .await
                .map_err(|e| LockError::Unavailable(e.to_string()))?;

        if !acquired {
            // `local` drops here and frees the in-process entry
            conn.close().await.ok();
            return Err(LockError::Conflict {
                database: database.to_string(),
                holder: "another orchestrator".to_string(),
            });
        }

        debug!("Advisory migration lock for {} acquired by {}", database, holder);
        Ok(Box::new(AdvisoryLease {
            database: database.to_string(),
            conn: Some(conn),
            local: Some(local),
        }))
    }
}

struct AdvisoryLease {
    database: String,
    conn: Option<PgConnection>,
    local: Option<Box<dyn MigrationLease>>,
}

#[async_trait]
impl MigrationLease for AdvisoryLease {
    fn database(&self) -> &str {
        &self.database
    }

    async fn release(mut self: Box<Self>) -> anyhow::Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let unlocked: bool =
                sqlx::query_scalar("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
                    .bind(&self.database)
                    .fetch_one(&mut conn)
                    .await?;
            if !unlocked {
                warn!(
                    "Advisory migration lock for {} was not held at release",
                    self.database
                );
            }
            conn.close().await?;
        }

        if let Some(local) = self.local.take() {
            local.release().await?;
        }

        debug!("Advisory migration lock for {} released", self.database);
        Ok(())
    }
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                "Migration lock for {} dropped without release; closing its session",
                self.database
            );
        }
    }
}
