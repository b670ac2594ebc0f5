//! Container execution environment
//!
//! Every build and migration action runs its commands in a fresh,
//! single-purpose container with the source checkout mounted at `/workspace`.
//! The container is removed when the commands finish.
//!
//! Secret values are handed to podman through the process environment and
//! forwarded with `-e NAME`, so they never appear in argument lists or logs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Environment variable whose value must not be logged
#[derive(Clone)]
pub struct SecretEnv {
    pub name: String,
    pub value: String,
}

impl fmt::Debug for SecretEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEnv")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// What to run inside the container
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub image: String,
    /// Host directory mounted at `/workspace`
    pub workdir: PathBuf,
    pub commands: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub secret_env: Vec<SecretEnv>,
}

/// Result of running a command set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Isolated execution environment for action commands
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Runs the commands in order, stopping at the first failure
    ///
    /// A non-zero exit is reported through [`CommandOutput`]; `Err` means the
    /// environment itself could not be used.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Builds an image from `dockerfile` inside `context` and tags it
    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<()>;

    /// Pushes a tagged image to its registry
    async fn push_image(&self, tag: &str) -> Result<()>;
}

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Podman-backed execution environment
#[derive(Debug, Clone, Default)]
pub struct PodmanEnvironment;

impl PodmanEnvironment {
    pub fn new() -> Self {
        Self
    }

    /// Builds the `podman run` invocation for a command set
    fn run_command(spec: &CommandSpec) -> Command {
        let mut command = Command::new("podman");
        command
            .arg("run")
            .arg("--rm")
            // Override any image entrypoint so every image runs the same way
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!("{}:/workspace", spec.workdir.display()))
            .arg("-w")
            .arg("/workspace");

        for (key, value) in &spec.env_vars {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        for secret in &spec.secret_env {
            command.arg("-e").arg(&secret.name);
            command.env(&secret.name, &secret.value);
        }

        command
            .arg(&spec.image)
            .arg("-c")
            .arg(Self::script(&spec.commands));
        command
    }

    fn script(commands: &[String]) -> String {
        let mut script = String::from("set -e\n");
        for cmd in commands {
            script.push_str(cmd);
            script.push('\n');
        }
        script
    }

    async fn podman(args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new("podman")
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute podman {}", args.first().unwrap_or(&"")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ExecutionEnvironment for PodmanEnvironment {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tokio::fs::create_dir_all(&spec.workdir)
            .await
            .context("Failed to create workspace directory")?;

        debug!(
            "Running {} command(s) in {} (workspace {})",
            spec.commands.len(),
            spec.image,
            spec.workdir.display()
        );

        let output = Self::run_command(spec)
            .output()
            .await
            .context("Failed to execute podman run command")?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if result.success() {
            debug!(
                "Commands completed successfully: stdout_len={}, stderr_len={}",
                result.stdout.len(),
                result.stderr.len()
            );
        } else {
            debug!(
                "Commands failed in {}: exit_code={} stderr='{}'",
                spec.image,
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        info!("Building image {} from {}", tag, context.display());

        let context_arg = context.display().to_string();
        let dockerfile_arg = context.join(dockerfile).display().to_string();
        let output = Self::podman(&["build", "-t", tag, "-f", &dockerfile_arg, &context_arg]).await?;

        if !output.success() {
            error!("Image build failed for {}: {}", tag, output.stderr.trim());
            anyhow::bail!(
                "podman build exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<()> {
        info!("Pushing image {}", tag);

        let output = Self::podman(&["push", tag]).await?;
        if !output.success() {
            error!("Image push failed for {}: {}", tag, output.stderr.trim());
            anyhow::bail!(
                "podman push exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CommandSpec {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("RUST_LOG".to_string(), "info".to_string());

        CommandSpec {
            image: "docker.io/migrate/migrate".to_string(),
            workdir: PathBuf::from("/tmp/convoy/run/source"),
            commands: vec!["migrate up".to_string()],
            env_vars,
            secret_env: vec![SecretEnv {
                name: "DB_PASSWORD".to_string(),
                value: "hunter2".to_string(),
            }],
        }
    }

    #[test]
    fn test_secret_values_stay_out_of_arguments() {
        let command = PodmanEnvironment::run_command(&spec());
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"DB_PASSWORD".to_string()));
        assert!(args.contains(&"RUST_LOG=info".to_string()));
        assert!(args.iter().all(|arg| !arg.contains("hunter2")));
    }

    #[test]
    fn test_script_stops_on_first_failure() {
        let script = PodmanEnvironment::script(&["make".to_string(), "make test".to_string()]);
        assert_eq!(script, "set -e\nmake\nmake test\n");
    }

    #[test]
    fn test_secret_env_debug_is_redacted() {
        let rendered = format!("{:?}", spec());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
