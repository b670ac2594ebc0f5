//! Run domain types
//!
//! A run is one execution of a pipeline against one environment. Its trail
//! records the status of every stage and action so operators can see exactly
//! where a run stopped and why.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::action::ActionKind;
use crate::domain::failure::Failure;
use crate::domain::pipeline::Pipeline;

/// Run execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Stage and action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never started because the run aborted first
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Trail entry for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action_id: String,
    pub kind: ActionKind,
    pub status: StepStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failure: Option<Failure>,
}

impl ActionReport {
    pub fn pending(action_id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            action_id: action_id.into(),
            kind,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }
}

/// Trail entry for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub ordinal: u32,
    pub status: StepStatus,
    pub actions: Vec<ActionReport>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StageReport {
    pub fn action(&self, action_id: &str) -> Option<&ActionReport> {
        self.actions.iter().find(|a| a.action_id == action_id)
    }
}

/// Progress notifications emitted while a run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    SourceRetrieved { revision: String },
    StageStarted { ordinal: u32 },
    ActionStarted { ordinal: u32, action_id: String },
    ActionFinished { ordinal: u32, report: ActionReport },
    StageFinished { report: StageReport },
}

/// Stage-by-stage status trail of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunTrail {
    pub stages: Vec<StageReport>,
}

impl RunTrail {
    /// Trail with every stage and action pending
    pub fn pending(pipeline: &Pipeline) -> Self {
        let stages = pipeline
            .stages()
            .iter()
            .map(|stage| StageReport {
                name: stage.name.clone(),
                ordinal: stage.ordinal,
                status: StepStatus::Pending,
                actions: stage
                    .actions
                    .iter()
                    .map(|action| ActionReport::pending(action.id.clone(), action.kind()))
                    .collect(),
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self { stages }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Folds a progress event into the trail
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::SourceRetrieved { .. } => {}
            RunEvent::StageStarted { ordinal } => {
                if let Some(stage) = self.stages.get_mut(*ordinal as usize) {
                    stage.status = StepStatus::Running;
                    stage.started_at = Some(chrono::Utc::now());
                }
            }
            RunEvent::ActionStarted { ordinal, action_id } => {
                if let Some(action) = self.action_mut(*ordinal, action_id) {
                    action.status = StepStatus::Running;
                    action.started_at = Some(chrono::Utc::now());
                }
            }
            RunEvent::ActionFinished { ordinal, report } => {
                if let Some(action) = self.action_mut(*ordinal, &report.action_id) {
                    *action = report.clone();
                }
            }
            RunEvent::StageFinished { report } => {
                if let Some(stage) = self.stages.get_mut(report.ordinal as usize) {
                    *stage = report.clone();
                }
            }
        }
    }

    /// Marks everything not yet terminal as skipped
    pub fn skip_remaining(&mut self) {
        for stage in &mut self.stages {
            for action in &mut stage.actions {
                if !action.status.is_terminal() {
                    action.status = StepStatus::Skipped;
                }
            }
            if !stage.status.is_terminal() {
                stage.status = StepStatus::Skipped;
            }
        }
    }

    fn action_mut(&mut self, ordinal: u32, action_id: &str) -> Option<&mut ActionReport> {
        self.stages
            .get_mut(ordinal as usize)?
            .actions
            .iter_mut()
            .find(|a| a.action_id == action_id)
    }
}

/// Outcome of executing a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: RunStatus,
    /// Source revision the run was pinned to, when retrieval succeeded
    pub revision: Option<String>,
    pub trail: RunTrail,
    /// First failure of the run
    pub cause: Option<Failure>,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Persisted run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub environment: String,
    /// Resolved once at instantiation
    pub branch: String,
    pub status: RunStatus,
    pub revision: Option<String>,
    pub trail: RunTrail,
    pub cause: Option<Failure>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trail() -> RunTrail {
        RunTrail {
            stages: vec![
                StageReport {
                    name: "build".to_string(),
                    ordinal: 0,
                    status: StepStatus::Pending,
                    actions: vec![ActionReport::pending("image", ActionKind::Build)],
                    started_at: None,
                    finished_at: None,
                },
                StageReport {
                    name: "deploy".to_string(),
                    ordinal: 1,
                    status: StepStatus::Pending,
                    actions: vec![ActionReport::pending("rollout", ActionKind::Deploy)],
                    started_at: None,
                    finished_at: None,
                },
            ],
        }
    }

    #[test]
    fn test_apply_events() {
        let mut trail = trail();
        trail.apply(&RunEvent::StageStarted { ordinal: 0 });
        trail.apply(&RunEvent::ActionStarted {
            ordinal: 0,
            action_id: "image".to_string(),
        });

        let stage = trail.stage("build").unwrap();
        assert_eq!(stage.status, StepStatus::Running);
        assert_eq!(stage.action("image").unwrap().status, StepStatus::Running);
        assert_eq!(
            trail.stage("deploy").unwrap().status,
            StepStatus::Pending
        );
    }

    #[test]
    fn test_skip_remaining_keeps_terminal_steps() {
        let mut trail = trail();
        trail.stages[0].status = StepStatus::Failed;
        trail.stages[0].actions[0].status = StepStatus::Failed;
        trail.skip_remaining();

        assert_eq!(trail.stages[0].status, StepStatus::Failed);
        assert_eq!(trail.stages[1].status, StepStatus::Skipped);
        assert_eq!(trail.stages[1].actions[0].status, StepStatus::Skipped);
    }

    #[test]
    fn test_unknown_ordinal_is_ignored() {
        let mut trail = trail();
        trail.apply(&RunEvent::StageStarted { ordinal: 7 });
        assert_eq!(trail, self::trail());
    }
}
