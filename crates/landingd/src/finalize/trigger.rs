//! Entry points that start, inspect and cancel finalize runs.
//!
//! Every check before `try_start` is read-only, so a declined trigger leaves
//! no trace in the tracker or the store.

use super::pipeline::FinalizePipeline;
use super::state::FinalizeState;
use super::tracker::{FinalizeTracker, StartOutcome};
use crate::projects::{Project, ProjectError, ProjectRegistry};
use crate::publisher::EventPublisher;
use crate::storage::StorageError;
use landing_core::{
    Event, FinalizeSnapshot, FinalizeView, Id, NotStarted, PersistedFinalize, Task, TaskStatus,
    TaskWeight,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task cannot be finalized in status: {} (use force=true to override)", status.as_str())]
    NotFinalizable { status: TaskStatus },
    #[error("finalize is disabled for {} tasks (use gate_override=true to override)", weight.as_str())]
    Gated { weight: TaskWeight },
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for TriggerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TaskNotFound(id) => Self::TaskNotFound(id),
            other => Self::Storage(other),
        }
    }
}

/// Flags accepted by a manual trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManualTrigger {
    /// Allow statuses other than completed, planned and failed.
    pub force: bool,
    /// Run even when configuration or task weight would skip finalize.
    pub gate_override: bool,
}

/// Starts finalize runs and answers status reads.
#[derive(Clone)]
pub struct FinalizeTrigger {
    projects: Arc<ProjectRegistry>,
    tracker: Arc<FinalizeTracker>,
    publisher: Arc<dyn EventPublisher>,
    server_token: CancellationToken,
}

impl std::fmt::Debug for FinalizeTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizeTrigger")
            .field("projects", &self.projects)
            .field("runs", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl FinalizeTrigger {
    /// Runs started here get a child of `server_token`, so cancelling it
    /// cancels every in-flight run.
    pub fn new(
        projects: Arc<ProjectRegistry>,
        tracker: Arc<FinalizeTracker>,
        publisher: Arc<dyn EventPublisher>,
        server_token: CancellationToken,
    ) -> Self {
        Self {
            projects,
            tracker,
            publisher,
            server_token,
        }
    }

    pub fn projects(&self) -> &Arc<ProjectRegistry> {
        &self.projects
    }

    pub fn tracker(&self) -> &Arc<FinalizeTracker> {
        &self.tracker
    }

    fn in_flight(&self, task_id: &Id) -> bool {
        self.tracker
            .get(task_id)
            .is_some_and(|state| !state.is_terminal())
    }

    /// Start a run after a PR approval. Returns `Ok(false)` when the task is
    /// not eligible or a run is already in flight.
    pub async fn trigger_on_approval(
        &self,
        task_id: &Id,
        project_id: &str,
    ) -> Result<bool, TriggerError> {
        let project = self.projects.resolve(project_id)?;
        let config = &project.config;

        if !config.should_auto_trigger_finalize_on_approval() {
            debug!(task_id = %task_id, "auto finalize disabled");
            return Ok(false);
        }
        if self.in_flight(task_id) {
            debug!(task_id = %task_id, "finalize already in flight");
            return Ok(false);
        }

        let task = project.store.load_task(task_id).await?;
        if let Some(reason) = auto_skip_reason(project, &task) {
            debug!(task_id = %task_id, reason, "auto finalize skipped");
            return Ok(false);
        }

        let state = Arc::new(FinalizeState::new(
            task_id.clone(),
            "Initializing",
            "Auto-triggered on PR approval",
        ));
        let started = self.start(project, state).started();
        if started {
            info!(task_id = %task_id, project = %project.id, "finalize auto-triggered on approval");
        }
        Ok(started)
    }

    /// Start a run on request. An in-flight run is returned as
    /// `(false, snapshot)` rather than an error.
    pub async fn trigger_manual(
        &self,
        task_id: &Id,
        project_id: &str,
        flags: ManualTrigger,
    ) -> Result<(bool, FinalizeSnapshot), TriggerError> {
        let project = self.projects.resolve(project_id)?;
        let task = project.store.load_task(task_id).await?;

        if !flags.force
            && !matches!(
                task.status,
                TaskStatus::Completed | TaskStatus::Planned | TaskStatus::Failed
            )
        {
            return Err(TriggerError::NotFinalizable {
                status: task.status,
            });
        }
        if !flags.gate_override && !project.config.should_run_finalize(task.weight) {
            return Err(TriggerError::Gated {
                weight: task.weight,
            });
        }

        let state = Arc::new(FinalizeState::new(
            task_id.clone(),
            "Initializing",
            "Starting finalize process",
        ));
        let initial = state.snapshot();
        match self.start(project, state) {
            StartOutcome::Started => {
                info!(
                    task_id = %task_id,
                    force = flags.force,
                    gate_override = flags.gate_override,
                    "finalize started"
                );
                Ok((true, initial))
            }
            StartOutcome::InFlight(existing) => Ok((false, existing.snapshot())),
        }
    }

    /// Live run if tracked, else the persisted finalize phase, else
    /// `not_started`.
    pub async fn finalize_status(
        &self,
        task_id: &Id,
        project_id: &str,
    ) -> Result<FinalizeView, TriggerError> {
        if let Some(state) = self.tracker.get(task_id) {
            return Ok(FinalizeView::Live(state.snapshot()));
        }

        let project = self.projects.resolve(project_id)?;
        let task = project.store.load_task(task_id).await?;
        Ok(match task.finalize_phase() {
            Some(phase) => {
                FinalizeView::Persisted(PersistedFinalize::from_phase(task_id.clone(), phase))
            }
            None => FinalizeView::NotStarted(NotStarted::new(task_id.clone())),
        })
    }

    /// Request cancellation of a task's run. Returns false when nothing was
    /// running.
    pub fn cancel_finalize(&self, task_id: &Id) -> bool {
        let cancelled = self.tracker.cancel(task_id);
        if cancelled {
            info!(task_id = %task_id, "finalize cancellation requested");
        }
        cancelled
    }

    /// Cancel any run and drop the task's tracker entry once it is
    /// terminal. A run still in flight keeps its entry until it fails, and
    /// the cleanup loop removes it after retention.
    pub fn discard(&self, task_id: &Id) {
        self.tracker.cancel(task_id);
        if self.tracker.delete_terminal(task_id).is_none() {
            debug!(task_id = %task_id, "finalize entry kept until run ends");
        }
    }

    fn start(&self, project: &Project, state: Arc<FinalizeState>) -> StartOutcome {
        let token = self.server_token.child_token();
        let outcome = self
            .tracker
            .try_start_with_cancel(Arc::clone(&state), token.clone());
        if !outcome.started() {
            return outcome;
        }

        self.publisher
            .publish(Event::finalize_progress(state.snapshot()));

        let pipeline = FinalizePipeline::new(
            project.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.publisher),
            state,
            token,
        );
        tokio::spawn(pipeline.run());
        outcome
    }
}

/// Why an approval should not start a run, if it should not.
fn auto_skip_reason(project: &Project, task: &Task) -> Option<&'static str> {
    if !project.config.should_run_finalize(task.weight) {
        Some("weight not eligible")
    } else if task.status != TaskStatus::Completed {
        Some("task not completed")
    } else if task.is_finalized() {
        Some("already finalized")
    } else {
        None
    }
}
