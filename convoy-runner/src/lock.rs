//! Per-database migration lock
//!
//! At most one migration may run against a database at a time, across every
//! run in flight. A second attempt fails immediately with a conflict; it is
//! never queued. Leases must be released on success and failure alike.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("database '{database}' is already being migrated by {holder}")]
    Conflict { database: String, holder: String },

    #[error("migration lock unavailable: {0}")]
    Unavailable(String),
}

/// Exclusive migration lock keyed by database identity
#[async_trait]
pub trait MigrationLock: Send + Sync {
    /// Acquires the lock for `database` without waiting
    ///
    /// # Arguments
    /// * `database` - Target database identity
    /// * `holder` - Human-readable owner, reported to whoever conflicts with it
    ///
    /// # Errors
    /// `LockError::Conflict` if another holder has the lock
    async fn try_acquire(
        &self,
        database: &str,
        holder: &str,
    ) -> Result<Box<dyn MigrationLease>, LockError>;
}

/// A held migration lock
///
/// Dropping a lease without releasing it still frees the lock, so an action
/// that unwinds cannot leave its database locked.
#[async_trait]
pub trait MigrationLease: Send {
    fn database(&self) -> &str;

    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

type Holders = Arc<Mutex<HashMap<String, String>>>;

/// Process-local migration lock
#[derive(Debug, Clone, Default)]
pub struct InMemoryMigrationLock {
    holders: Holders,
}

impl InMemoryMigrationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a database's lock
    pub fn holder(&self, database: &str) -> Option<String> {
        self.holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(database)
            .cloned()
    }
}

#[async_trait]
impl MigrationLock for InMemoryMigrationLock {
    async fn try_acquire(
        &self,
        database: &str,
        holder: &str,
    ) -> Result<Box<dyn MigrationLease>, LockError> {
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = holders.get(database) {
            return Err(LockError::Conflict {
                database: database.to_string(),
                holder: current.clone(),
            });
        }

        holders.insert(database.to_string(), holder.to_string());
        debug!("Migration lock for {} acquired by {}", database, holder);

        Ok(Box::new(InMemoryLease {
            database: database.to_string(),
            holders: Arc::clone(&self.holders),
            released: false,
        }))
    }
}

struct InMemoryLease {
    database: String,
    holders: Holders,
    released: bool,
}

impl InMemoryLease {
    fn free(&mut self) {
        if !self.released {
            self.holders
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.database);
            self.released = true;
        }
    }
}

#[async_trait]
impl MigrationLease for InMemoryLease {
    fn database(&self) -> &str {
        &self.database
    }

    async fn release(mut self: Box<Self>) -> anyhow::Result<()> {
        self.free();
        debug!("Migration lock for {} released", self.database);
        Ok(())
    }
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Migration lock for {} dropped without release; freeing it",
                self.database
            );
            self.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_conflicts() {
        let lock = InMemoryMigrationLock::new();

        let lease = lock.try_acquire("svc-db", "run-a/migrate").await.unwrap();
        let second = lock.try_acquire("svc-db", "run-b/migrate").await;

        match second {
            Err(LockError::Conflict { database, holder }) => {
                assert_eq!(database, "svc-db");
                assert_eq!(holder, "run-a/migrate");
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }

        lease.release().await.unwrap();
        assert!(lock.try_acquire("svc-db", "run-b/migrate").await.is_ok());
    }

    #[tokio::test]
    async fn test_databases_are_independent() {
        let lock = InMemoryMigrationLock::new();

        let _a = lock.try_acquire("orders", "run-a").await.unwrap();
        let _b = lock.try_acquire("billing", "run-b").await.unwrap();

        assert_eq!(lock.holder("orders").as_deref(), Some("run-a"));
        assert_eq!(lock.holder("billing").as_deref(), Some("run-b"));
    }

    #[tokio::test]
    async fn test_drop_frees_lock() {
        let lock = InMemoryMigrationLock::new();

        {
            let _lease = lock.try_acquire("svc-db", "run-a").await.unwrap();
            assert!(lock.holder("svc-db").is_some());
        }

        assert!(lock.holder("svc-db").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_attempts_exactly_one_wins() {
        let lock = InMemoryMigrationLock::new();

        let attempts = (0..8).map(|i| {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.try_acquire("svc-db", &format!("run-{}", i))
                    .await
                    .map(|lease| std::mem::forget(lease))
            })
        });

        let mut acquired = 0;
        let mut conflicts = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            match attempt.await.unwrap() {
                Ok(()) => acquired += 1,
                Err(LockError::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(acquired, 1);
        assert_eq!(conflicts, 7);
    }
}
