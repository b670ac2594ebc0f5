//! Source retrieval
//!
//! The first thing a run does is pin the environment's branch to a revision
//! and check it out. Any failure here is `SourceUnavailable`: no stage runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use convoy_core::domain::artifact::SourceBundle;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Retrieves a branch of a repository into a local directory
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Checks out `branch` of `repository` into `destination`
    ///
    /// # Returns
    /// The bundle, pinned to the revision that was checked out
    async fn fetch(
        &self,
        repository: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<SourceBundle>;
}

/// Git-backed source provider (shallow clone of a single branch)
#[derive(Debug, Clone, Default)]
pub struct GitSource;

impl GitSource {
    pub fn new() -> Self {
        Self
    }

    async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments of the shallow clone; `--` keeps the repository from being read
/// as an option
fn clone_args<'a>(repository: &'a str, branch: &'a str, destination: &'a str) -> [&'a str; 9] {
    [
        "clone",
        "--depth",
        "1",
        "--single-branch",
        "--branch",
        branch,
        "--",
        repository,
        destination,
    ]
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn fetch(
        &self,
        repository: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<SourceBundle> {
        info!("Fetching {} (branch {})", repository, branch);

        if repository.starts_with('-') {
            anyhow::bail!("Repository '{}' looks like a git option", repository);
        }

        if destination.exists() {
            // Re-running a run id must start from a clean checkout
            tokio::fs::remove_dir_all(destination)
                .await
                .context("Failed to clear previous checkout")?;
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create workspace directory")?;
        }

        let destination_arg = destination.display().to_string();
        Self::git(&clone_args(repository, branch, &destination_arg), None)
            .await
            .with_context(|| format!("Branch '{}' of {} is unavailable", branch, repository))?;

        let revision = Self::git(&["rev-parse", "HEAD"], Some(destination))
            .await
            .context("Failed to resolve checked out revision")?;

        debug!("Checked out {} at {}", branch, revision);

        Ok(SourceBundle {
            repository: repository.to_string(),
            branch: branch.to_string(),
            revision,
            path: destination_arg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_args_end_options_before_repository() {
        let args = clone_args("--upload-pack=touch /tmp/x", "main", "/work/run/source");
        let separator = args.iter().position(|arg| *arg == "--").unwrap();
        assert_eq!(args[separator + 1], "--upload-pack=touch /tmp/x");
        assert_eq!(args[separator + 2], "/work/run/source");
        assert_eq!(args.len(), separator + 3);
    }

    #[tokio::test]
    async fn test_option_like_repository_is_not_fetched() {
        let workspace = tempfile::tempdir().unwrap();
        let destination = workspace.path().join("source");

        let err = GitSource::new()
            .fetch("--upload-pack=touch /tmp/x", "main", &destination)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("looks like a git option"));
        assert!(!destination.exists());
    }
}
