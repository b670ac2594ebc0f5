//! Convoy Runner
//!
//! The execution engine behind the orchestrator and `convoy run --local`.
//!
//! Architecture:
//! - Sequencer: stage-by-stage execution of a validated pipeline, with
//!   bounded parallelism inside a stage and a run trail folded from events
//! - Actions: build, migrate and deploy, each against trait seams
//!   (source provider, execution environment, migration lock, secret store)
//! - Runtime: long-lived service runtimes with health-gated rollouts,
//!   automatic rollback and target-tracking autoscaling
//!
//! Every external system sits behind a trait with a podman/git backed
//! implementation, so whole runs can be exercised in-process.

pub mod actions;
pub mod artifact_store;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod log_buffer;
pub mod podman;
pub mod runtime;
pub mod secrets;
pub mod sequencer;
pub mod source;

#[cfg(test)]
mod testing;

pub use config::RunnerConfig;
pub use context::{AbortSignal, RunContext};
pub use lock::{InMemoryMigrationLock, LockError, MigrationLease, MigrationLock};
pub use log_buffer::{InMemoryLogBuffer, LogBufferService};
pub use podman::{ExecutionEnvironment, PodmanEnvironment, check_podman_available};
pub use secrets::{
    ChainedSecretStore, DatabaseCredentials, EnvSecretStore, InMemorySecretStore, SecretStore,
};
pub use sequencer::{Engine, Sequencer};
pub use source::{GitSource, SourceProvider};
