//! Secret resolution
//!
//! Pipelines only ever hold [`SecretRef`] names. The values are looked up at
//! the moment a migration starts and are handed straight to its execution
//! environment.

use async_trait::async_trait;
use convoy_core::domain::action::SecretRef;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::podman::SecretEnv;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("{0} is not defined")]
    NotFound(SecretRef),

    #[error("{secret} is malformed: {reason}")]
    Malformed { secret: SecretRef, reason: String },
}

/// Database connection parameters
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,
}

impl DatabaseCredentials {
    /// Environment variables a migration container receives
    pub fn to_env(&self) -> Vec<SecretEnv> {
        [
            ("DB_HOST", self.host.clone()),
            ("DB_PORT", self.port.to_string()),
            ("DB_USER", self.username.clone()),
            ("DB_PASSWORD", self.password.clone()),
            ("DB_NAME", self.dbname.clone()),
        ]
        .into_iter()
        .map(|(name, value)| SecretEnv {
            name: name.to_string(),
            value,
        })
        .collect()
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// Resolves secret references to credentials
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, secret: &SecretRef) -> Result<DatabaseCredentials, SecretError>;
}

/// Reads secrets from `CONVOY_SECRET_<NAME>` environment variables
///
/// The value is a JSON object with `host`, `port`, `username`, `password`
/// and `dbname`. Names are upper-cased and `-`/`.` become `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn new() -> Self {
        Self
    }

    pub fn variable_name(secret: &SecretRef) -> String {
        let normalized: String = secret
            .0
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("CONVOY_SECRET_{}", normalized)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, secret: &SecretRef) -> Result<DatabaseCredentials, SecretError> {
        let raw = std::env::var(Self::variable_name(secret))
            .map_err(|_| SecretError::NotFound(secret.clone()))?;

        // Only the parse error's category is kept; its text could echo the value
        serde_json::from_str(&raw).map_err(|e| SecretError::Malformed {
            secret: secret.clone(),
            reason: format!("{:?} error at line {}", e.classify(), e.line()),
        })
    }
}

/// Secret store held in memory (local runs, provisioning, tests)
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, DatabaseCredentials>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, secret: SecretRef, credentials: DatabaseCredentials) {
        self.secrets.write().await.insert(secret.0, credentials);
    }

    pub async fn contains(&self, secret: &SecretRef) -> bool {
        self.secrets.read().await.contains_key(&secret.0)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn resolve(&self, secret: &SecretRef) -> Result<DatabaseCredentials, SecretError> {
        self.secrets
            .read()
            .await
            .get(&secret.0)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(secret.clone()))
    }
}

/// Tries each store in order; the first one that knows the secret answers
pub struct ChainedSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainedSecretStore {
    pub fn new(stores: Vec<Arc<dyn SecretStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl SecretStore for ChainedSecretStore {
    async fn resolve(&self, secret: &SecretRef) -> Result<DatabaseCredentials, SecretError> {
        for store in &self.stores {
            match store.resolve(secret).await {
                Err(SecretError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(SecretError::NotFound(secret.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> DatabaseCredentials {
        DatabaseCredentials {
            host: "db.internal".to_string(),
            port: 5432,
            username: "svc".to_string(),
            password: "hunter2".to_string(),
            dbname: "svc".to_string(),
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("db.internal"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_variable_name() {
        let name = EnvSecretStore::variable_name(&SecretRef("svc-db.credentials".to_string()));
        assert_eq!(name, "CONVOY_SECRET_SVC_DB_CREDENTIALS");
    }

    #[test]
    fn test_to_env() {
        let env = credentials().to_env();
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["DB_HOST", "DB_PORT", "DB_USER", "DB_PASSWORD", "DB_NAME"]
        );
        assert_eq!(env[1].value, "5432");
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySecretStore::new();
        let secret = SecretRef("svc-db".to_string());

        assert!(matches!(
            store.resolve(&secret).await,
            Err(SecretError::NotFound(_))
        ));

        store.insert(secret.clone(), credentials()).await;
        assert_eq!(store.resolve(&secret).await.unwrap(), credentials());
    }

    #[tokio::test]
    async fn test_chained_store_falls_through() {
        let first = Arc::new(InMemorySecretStore::new());
        let second = Arc::new(InMemorySecretStore::new());
        let secret = SecretRef("svc-db".to_string());
        second.insert(secret.clone(), credentials()).await;

        let chained = ChainedSecretStore::new(vec![first as Arc<dyn SecretStore>, second]);
        assert_eq!(chained.resolve(&secret).await.unwrap(), credentials());
        assert!(matches!(
            chained.resolve(&SecretRef("other".to_string())).await,
            Err(SecretError::NotFound(_))
        ));
    }
}
