//! Task platforms
//!
//! A task platform launches, health-checks and stops the task instances a
//! service runtime is made of. The runtime owns the decisions; the platform
//! only carries them out. Tasks are tagged with their service and environment
//! so a runtime created after a restart can find the ones already running.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier of a task instance on its platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task and the image it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    pub id: TaskId,
    pub image: String,
}

/// Compute target for service tasks
#[async_trait]
pub trait TaskPlatform: Send + Sync {
    /// Launches one task of `service` in `environment` running `image`
    async fn launch(&self, service: &str, environment: &str, image: &str) -> Result<TaskId>;

    /// Tasks of `service` in `environment` that are currently running
    async fn list(&self, service: &str, environment: &str) -> Result<Vec<RunningTask>>;

    /// Whether the task currently passes its health check
    async fn is_healthy(&self, task: &TaskId) -> Result<bool>;

    /// Stops and removes a task; stopping an unknown task succeeds
    async fn stop(&self, task: &TaskId) -> Result<()>;
}

// =============================================================================
// Podman
// =============================================================================

const SERVICE_LABEL: &str = "convoy.service";
const ENVIRONMENT_LABEL: &str = "convoy.environment";

/// Runs service tasks as detached podman containers on this host
///
/// Health follows the image's HEALTHCHECK when it has one, and the container
/// running state otherwise.
#[derive(Debug, Clone, Default)]
pub struct PodmanTaskPlatform;

impl PodmanTaskPlatform {
    pub fn new() -> Self {
        Self
    }

    fn container_name(service: &str, environment: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("convoy-{}-{}-{}", service, environment, &suffix[..12])
    }
}

/// Parses `podman ps --format '{{.Names}} {{.Image}}'` output
fn parse_task_list(stdout: &str) -> Vec<RunningTask> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let image = fields.next()?;
            Some(RunningTask {
                id: TaskId(name.to_string()),
                image: image.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl TaskPlatform for PodmanTaskPlatform {
    async fn launch(&self, service: &str, environment: &str, image: &str) -> Result<TaskId> {
        let name = Self::container_name(service, environment);
        info!("Launching task {} with image {}", name, image);

        let output = Command::new("podman")
            .arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&name)
            .arg("--label")
            .arg(format!("{}={}", SERVICE_LABEL, service))
            .arg("--label")
            .arg(format!("{}={}", ENVIRONMENT_LABEL, environment))
            .arg(image)
            .output()
            .await
            .context("Failed to execute podman run command")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to start task for image {}: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(TaskId(name))
    }

    async fn list(&self, service: &str, environment: &str) -> Result<Vec<RunningTask>> {
        let output = Command::new("podman")
            .arg("ps")
            .arg("--filter")
            .arg(format!("label={}={}", SERVICE_LABEL, service))
            .arg("--filter")
            .arg(format!("label={}={}", ENVIRONMENT_LABEL, environment))
            .arg("--format")
            .arg("{{.Names}} {{.Image}}")
            .output()
            .await
            .context("Failed to execute podman ps command")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to list tasks of {}/{}: {}",
                service,
                environment,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_task_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn is_healthy(&self, task: &TaskId) -> Result<bool> {
        let output = Command::new("podman")
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Running}} {{.State.Health.Status}}")
            .arg(&task.0)
            .output()
            .await
            .context("Failed to execute podman inspect command")?;

        if !output.status.success() {
            return Ok(false);
        }

        let state = String::from_utf8_lossy(&output.stdout);
        let mut fields = state.split_whitespace();
        let running = fields.next() == Some("true");
        let health = fields.next().unwrap_or("");

        debug!("Task {} running={} health='{}'", task, running, health);

        Ok(running && (health.is_empty() || health == "healthy"))
    }

    async fn stop(&self, task: &TaskId) -> Result<()> {
        let output = Command::new("podman")
            .arg("rm")
            .arg("-f")
            .arg("--ignore")
            .arg(&task.0)
            .output()
            .await
            .context("Failed to execute podman rm command")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to stop task {}: {}",
                task,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

// =============================================================================
// Simulated
// =============================================================================

/// How tasks of an image behave under health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBehavior {
    Healthy,
    /// Healthy once the task has been checked this many times
    HealthyAfter(u32),
    Never,
}

#[derive(Debug, Clone)]
struct SimulatedTask {
    service: String,
    environment: String,
    image: String,
    checks: u32,
}

/// In-process task platform for local runs and tests
///
/// Tasks exist only in memory. Health behavior is chosen per image, and stop
/// calls can be made to fail to exercise rollback escalation.
#[derive(Default)]
pub struct SimulatedPlatform {
    tasks: Mutex<HashMap<TaskId, SimulatedTask>>,
    behaviors: Mutex<HashMap<String, HealthBehavior>>,
    failing_stops: AtomicU32,
    launches: AtomicU32,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how tasks running `image` respond to health checks
    pub async fn set_behavior(&self, image: &str, behavior: HealthBehavior) {
        self.behaviors
            .lock()
            .await
            .insert(image.to_string(), behavior);
    }

    /// Makes the next `count` stop calls fail
    pub fn fail_next_stops(&self, count: u32) {
        self.failing_stops.store(count, Ordering::SeqCst);
    }

    /// Images of the running tasks, sorted
    pub async fn running_images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .tasks
            .lock()
            .await
            .values()
            .map(|task| task.image.clone())
            .collect();
        images.sort();
        images
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Total number of tasks ever launched
    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskPlatform for SimulatedPlatform {
    async fn launch(&self, service: &str, environment: &str, image: &str) -> Result<TaskId> {
        let sequence = self.launches.fetch_add(1, Ordering::SeqCst);
        let id = TaskId(format!("{}-{}-{}", service, environment, sequence));

        self.tasks.lock().await.insert(
            id.clone(),
            SimulatedTask {
                service: service.to_string(),
                environment: environment.to_string(),
                image: image.to_string(),
                checks: 0,
            },
        );

        Ok(id)
    }

    async fn list(&self, service: &str, environment: &str) -> Result<Vec<RunningTask>> {
        let mut tasks: Vec<RunningTask> = self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|(_, task)| task.service == service && task.environment == environment)
            .map(|(id, task)| RunningTask {
                id: id.clone(),
                image: task.image.clone(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(tasks)
    }

    async fn is_healthy(&self, task: &TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(state) = tasks.get_mut(task) else {
            return Ok(false);
        };
        state.checks += 1;

        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&state.image)
            .copied()
            .unwrap_or(HealthBehavior::Healthy);

        Ok(match behavior {
            HealthBehavior::Healthy => true,
            HealthBehavior::HealthyAfter(checks) => state.checks >= checks,
            HealthBehavior::Never => false,
        })
    }

    async fn stop(&self, task: &TaskId) -> Result<()> {
        let should_fail = self
            .failing_stops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if should_fail {
            anyhow::bail!("simulated failure stopping task {}", task);
        }

        self.tasks.lock().await.remove(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_lifecycle() {
        let platform = SimulatedPlatform::new();

        let task = platform.launch("svc", "dev", "registry/svc:aaa").await.unwrap();
        assert!(platform.is_healthy(&task).await.unwrap());
        assert_eq!(platform.running_images().await, vec!["registry/svc:aaa"]);

        platform.stop(&task).await.unwrap();
        assert_eq!(platform.running_count().await, 0);
        assert!(!platform.is_healthy(&task).await.unwrap());
    }

    #[tokio::test]
    async fn test_healthy_after_checks() {
        let platform = SimulatedPlatform::new();
        platform
            .set_behavior("registry/svc:slow", HealthBehavior::HealthyAfter(3))
            .await;

        let task = platform.launch("svc", "dev", "registry/svc:slow").await.unwrap();
        assert!(!platform.is_healthy(&task).await.unwrap());
        assert!(!platform.is_healthy(&task).await.unwrap());
        assert!(platform.is_healthy(&task).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_service_and_environment() {
        let platform = SimulatedPlatform::new();
        let dev = platform.launch("svc", "dev", "registry/svc:aaa").await.unwrap();
        platform.launch("svc", "prod", "registry/svc:aaa").await.unwrap();
        platform.launch("other", "dev", "registry/other:aaa").await.unwrap();

        let listed = platform.list("svc", "dev").await.unwrap();
        assert_eq!(
            listed,
            vec![RunningTask {
                id: dev,
                image: "registry/svc:aaa".to_string(),
            }]
        );
        assert!(platform.list("svc", "staging").await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_task_list() {
        let stdout = "convoy-svc-dev-0123456789ab registry/svc:aaa\n\nconvoy-svc-dev-ba9876543210 registry/svc:bbb\n";
        let tasks = parse_task_list(stdout);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, TaskId("convoy-svc-dev-0123456789ab".to_string()));
        assert_eq!(tasks[1].image, "registry/svc:bbb");
    }

    #[tokio::test]
    async fn test_failing_stops() {
        let platform = SimulatedPlatform::new();
        let task = platform.launch("svc", "dev", "registry/svc:aaa").await.unwrap();

        platform.fail_next_stops(1);
        assert!(platform.stop(&task).await.is_err());
        assert!(platform.stop(&task).await.is_ok());
        assert_eq!(platform.running_count().await, 0);
    }
}
