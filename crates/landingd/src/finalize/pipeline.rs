//! One finalize run, executed as its own tokio task.
//!
//! Steps: load config, reload the task, prepare the worktree, start the
//! finalize phase, sync via the executor, optionally wait for CI and merge,
//! complete, clean up. Cancellation is only observed between steps, so a
//! cancel request takes effect once the current step returns.

use super::state::FinalizeState;
use super::tracker::FinalizeTracker;
use crate::ci::CiError;
use crate::executor::{ExecutionContext, ExecutorError, PhaseUpdate};
use crate::git::{GitError, Worktree};
use crate::projects::Project;
use crate::publisher::EventPublisher;
use crate::storage::StorageError;
use chrono::Utc;
use landing_core::{
    Event, FinalizeResult, Id, PhaseStatus, PrStatus, Task, FINALIZE_PHASE,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lower and upper bound of the executor's share of the progress bar.
const EXECUTION_BAND: (u8, u8) = (20, 85);

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("cancelled {stage}: {reason}")]
    Cancelled { stage: &'static str, reason: String },
    #[error("load task: {0}")]
    LoadTask(StorageError),
    #[error("save task: {0}")]
    SaveTask(StorageError),
    #[error("git setup: {0}")]
    Git(#[from] GitError),
    #[error(transparent)]
    Executor(ExecutorError),
}

impl FinalizeError {
    fn cancelled(stage: &'static str) -> Self {
        Self::Cancelled {
            stage,
            reason: "cancellation requested".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Map an executor phase percentage (0-100) into the execution band.
fn band_percent(phase_percent: u8) -> u8 {
    let (low, high) = EXECUTION_BAND;
    let span = u16::from(high - low);
    low + (span * u16::from(phase_percent.min(100)) / 100) as u8
}

/// Releases the run's cancellation handle when dropped, including on panic.
struct CancelGuard {
    tracker: Arc<FinalizeTracker>,
    run: Arc<FinalizeState>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.run);
    }
}

struct Completed {
    result: FinalizeResult,
    step: &'static str,
    progress: String,
}

/// A single finalize run bound to one `FinalizeState`.
pub struct FinalizePipeline {
    project: Project,
    tracker: Arc<FinalizeTracker>,
    publisher: Arc<dyn EventPublisher>,
    state: Arc<FinalizeState>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FinalizePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizePipeline")
            .field("task_id", self.state.task_id())
            .field("project", &self.project.id)
            .finish_non_exhaustive()
    }
}

impl FinalizePipeline {
    pub fn new(
        project: Project,
        tracker: Arc<FinalizeTracker>,
        publisher: Arc<dyn EventPublisher>,
        state: Arc<FinalizeState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            project,
            tracker,
            publisher,
            state,
            cancel,
        }
    }

    /// Drive the run to a terminal state. Never returns an error: failures
    /// end up in the `FinalizeState` and in the published events.
    pub async fn run(self) {
        let task_id = self.state.task_id().clone();
        let guard = CancelGuard {
            tracker: Arc::clone(&self.tracker),
            run: Arc::clone(&self.state),
        };

        let outcome = self.execute(&task_id).await;

        // The handle must be gone before the state turns terminal.
        drop(guard);

        match outcome {
            Ok((done, worktree)) => {
                let commit = done.result.commit_sha.clone().unwrap_or_default();
                self.state.complete(done.step, &done.progress, done.result);
                self.publish();
                info!(task_id = %task_id, commit = %commit, "finalize completed");

                if self.project.config.worktree_cleanup_on_complete {
                    self.cleanup_worktree(&task_id, &worktree).await;
                }
            }
            Err(e) => {
                self.state.fail(&e.to_string(), e.is_cancelled());
                self.publish();
                error!(task_id = %task_id, error = %e, "finalize failed");
            }
        }
    }

    fn publish(&self) {
        self.publisher
            .publish(Event::finalize_progress(self.state.snapshot()));
    }

    fn step(&self, step: &str, progress: &str, percent: u8) {
        if self.state.progress(step, progress, percent) {
            self.publish();
        }
    }

    fn check_cancel(&self, stage: &'static str) -> Result<(), FinalizeError> {
        if self.cancel.is_cancelled() {
            Err(FinalizeError::cancelled(stage))
        } else {
            Ok(())
        }
    }

    async fn save(&self, task: &mut Task) -> Result<(), FinalizeError> {
        task.updated_at = Utc::now();
        self.project
            .store
            .save_task(task)
            .await
            .map_err(FinalizeError::SaveTask)
    }

    /// Record a failed finalize phase; the run is already failing.
    /// A task deleted mid-run stays deleted.
    async fn record_phase_failure(&self, task: &mut Task, error: &str) {
        if let Err(StorageError::TaskNotFound(_)) = self.project.store.load_task(&task.id).await {
            debug!(task_id = %task.id, "task deleted during finalize; not recording failure");
            return;
        }
        task.execution.fail_phase(FINALIZE_PHASE, error);
        if let Err(e) = self.save(task).await {
            warn!(task_id = %task.id, error = %e, "failed to persist failed finalize phase");
        }
    }

    fn update_callback(&self) -> Arc<dyn Fn(PhaseUpdate) + Send + Sync> {
        let state = Arc::clone(&self.state);
        let publisher = Arc::clone(&self.publisher);
        Arc::new(move |update: PhaseUpdate| {
            let percent = match update.status {
                PhaseStatus::Running => band_percent(50),
                PhaseStatus::Completed => band_percent(100),
                _ => return,
            };
            if state.progress("Executing finalize", &update.message, percent) {
                publisher.publish(Event::finalize_progress(state.snapshot()));
            }
        })
    }

    async fn execute(&self, task_id: &Id) -> Result<(Completed, Worktree), FinalizeError> {
        let project = &self.project;
        let config = &project.config;

        self.check_cancel("before start")?;
        if self
            .state
            .mark_running("Loading configuration", "Preparing finalize executor", 5)
        {
            self.publish();
        }

        let mut task = project
            .store
            .load_task(task_id)
            .await
            .map_err(FinalizeError::LoadTask)?;

        self.step("Setting up git", "Initializing git service", 10);
        let worktree = project.git.prepare(&project.work_dir, &task).await?;
        self.check_cancel("during setup")?;

        self.step("Executing finalize", "Syncing with target branch", 20);
        self.check_cancel("before execution")?;
        task.execution.start_phase(FINALIZE_PHASE);
        self.save(&mut task).await?;

        let target_branch = task
            .pr
            .as_ref()
            .and_then(|pr| pr.target_branch.clone())
            .filter(|b| !b.is_empty())
            .or_else(|| Some(config.target_branch.clone()).filter(|b| !b.is_empty()))
            .unwrap_or_else(|| "main".to_string());

        let ctx = ExecutionContext {
            worktree: worktree.clone(),
            target_branch: target_branch.clone(),
            on_update: self.update_callback(),
        };
        let report = match project.executor.execute(&self.cancel, &task, ctx).await {
            Ok(report) => report,
            Err(ExecutorError::Cancelled) => {
                let err = FinalizeError::cancelled("during execution");
                self.record_phase_failure(&mut task, &err.to_string()).await;
                return Err(err);
            }
            Err(e) => {
                self.record_phase_failure(&mut task, &e.to_string()).await;
                return Err(FinalizeError::Executor(e));
            }
        };
        if let Err(err) = self.check_cancel("after execution") {
            self.record_phase_failure(&mut task, &err.to_string()).await;
            return Err(err);
        }

        task.execution
            .complete_phase(FINALIZE_PHASE, Some(report.commit_sha.clone()));
        if let Err(e) = project
            .store
            .save_phase_output(task_id, FINALIZE_PHASE, &report.output)
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to save finalize output");
        }
        self.save(&mut task).await?;
        let mut result = report.into_result(&target_branch);

        if config.should_wait_for_ci() {
            self.check_cancel("before CI")?;
            self.step(
                "Waiting for CI",
                "Pushing changes and waiting for CI checks...",
                85,
            );
            self.wait_for_ci(&mut task, &worktree, &mut result).await?;
        }

        let (step, progress) = if result.merged == Some(true) {
            ("Merged", "PR merged successfully".to_string())
        } else if result.ci_passed == Some(true) {
            ("CI Passed", "CI passed, merge skipped".to_string())
        } else if let Some(merge_error) = &result.merge_error {
            ("Complete (merge pending)", merge_error.clone())
        } else {
            ("Complete", "Finalize completed successfully".to_string())
        };

        Ok((
            Completed {
                result,
                step,
                progress,
            },
            worktree,
        ))
    }

    /// CI wait and merge. Failures here are recorded in the result and do
    /// not fail the run; only cancellation does.
    async fn wait_for_ci(
        &self,
        task: &mut Task,
        worktree: &Worktree,
        result: &mut FinalizeResult,
    ) -> Result<(), FinalizeError> {
        match self
            .project
            .ci
            .wait_for_ci_and_merge(&self.cancel, task, worktree)
            .await
        {
            Ok(outcome) => {
                result.ci_passed = Some(outcome.ci_passed);
                result.ci_details = Some(outcome.details.clone());
                result.ci_timed_out = Some(outcome.timed_out);
                result.merged = Some(outcome.merged);
                result.merge_commit.clone_from(&outcome.merge_commit);
                if !outcome.ci_passed {
                    result.merge_error = Some(outcome.details);
                }

                if outcome.merged {
                    if let Some(pr) = task.pr.as_mut() {
                        pr.merged = true;
                        pr.status = PrStatus::Merged;
                        pr.merged_at = Some(Utc::now());
                        pr.merge_commit_sha = outcome.merge_commit;
                    }
                    if let Err(e) = self.save(task).await {
                        warn!(task_id = %task.id, error = %e, "failed to record merge");
                    }
                }
                Ok(())
            }
            Err(CiError::Cancelled) => Err(FinalizeError::cancelled("during CI wait")),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "CI wait/merge failed");
                self.publisher.publish(Event::warning(
                    Some(task.id.clone()),
                    format!("CI wait/merge failed: {e}"),
                ));
                result.merge_error = Some(e.to_string());
                Ok(())
            }
        }
    }

    async fn cleanup_worktree(&self, task_id: &Id, worktree: &Worktree) {
        if let Err(e) = self.project.git.cleanup(&self.project.work_dir, task_id).await {
            warn!(
                task_id = %task_id,
                path = %worktree.path.display(),
                error = %e,
                "worktree cleanup failed"
            );
            self.publisher.publish(Event::warning(
                Some(task_id.clone()),
                format!("worktree cleanup failed: {e}"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, CiBehavior, ExecBehavior, Fixture};
    use super::*;
    use landing_core::{EventPayload, FinalizeStatus, PhaseStatus};

    async fn run_pipeline(fx: &Fixture, cancel: CancellationToken) -> Arc<FinalizeState> {
        let state = Arc::new(FinalizeState::new(
            fx.task_id.clone(),
            "Initializing",
            "Starting finalize process",
        ));
        fx.tracker
            .try_start_with_cancel(Arc::clone(&state), cancel.clone());
        FinalizePipeline::new(
            fx.project.clone(),
            Arc::clone(&fx.tracker),
            fx.publisher(),
            Arc::clone(&state),
            cancel,
        )
        .run()
        .await;
        state
    }

    fn progress_events(fx: &mut Fixture) -> Vec<landing_core::FinalizeSnapshot> {
        let mut snapshots = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            if let EventPayload::FinalizeProgress(snapshot) = event.payload {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    #[test]
    fn band_maps_phase_progress() {
        assert_eq!(band_percent(0), 20);
        assert_eq!(band_percent(50), 52);
        assert_eq!(band_percent(100), 85);
    }

    #[tokio::test]
    async fn successful_sync_without_ci() {
        let mut fx = fixture(ExecBehavior::Succeed, CiBehavior::Disabled);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Completed);
        assert_eq!(snap.step, "Complete");
        assert_eq!(snap.progress, "Finalize completed successfully");
        assert_eq!(snap.step_percent, 100);
        let result = snap.result.unwrap();
        assert!(result.synced);
        assert_eq!(result.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(result.target_branch, "main");
        assert!(result.ci_passed.is_none());

        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        let phase = task.finalize_phase().unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.commit_sha.as_deref(), Some("abc123"));
        assert!(fx.git.cleaned());
        assert!(!fx.tracker.has_cancel(&fx.task_id));

        // Progress is monotonic and ends terminal.
        let events = progress_events(&mut fx);
        assert!(events.len() >= 5);
        assert!(events
            .windows(2)
            .all(|w| w[0].step_percent <= w[1].step_percent
                && w[0].status.rank() <= w[1].status.rank()));
        assert_eq!(events.last().unwrap().status, FinalizeStatus::Completed);
        assert!(events.iter().any(|s| s.step_percent == 52));
    }

    #[tokio::test]
    async fn executor_failure_fails_run() {
        let fx = fixture(ExecBehavior::Fail, CiBehavior::Disabled);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Failed);
        assert_eq!(snap.step, "Failed");
        assert!(snap.error.unwrap().contains("merge conflicts"));
        assert!(!snap.cancelled);
        assert!(snap.result.is_none());

        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        assert_eq!(task.finalize_phase().unwrap().status, PhaseStatus::Failed);
        assert!(!fx.git.cleaned());
        assert!(!fx.tracker.has_cancel(&fx.task_id));
    }

    #[tokio::test]
    async fn ci_error_is_not_fatal() {
        let fx = fixture(ExecBehavior::Succeed, CiBehavior::Error);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Completed);
        assert_eq!(snap.step, "Complete (merge pending)");
        let result = snap.result.unwrap();
        assert!(result.synced);
        assert!(result.merge_error.unwrap().contains("push failed"));
    }

    #[tokio::test]
    async fn ci_merge_marks_pr_merged() {
        let fx = fixture(ExecBehavior::Succeed, CiBehavior::Merge);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.step, "Merged");
        assert_eq!(snap.progress, "PR merged successfully");
        let result = snap.result.unwrap();
        assert_eq!(result.merged, Some(true));
        assert_eq!(result.merge_commit.as_deref(), Some("m3rg3"));

        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        let pr = task.pr.unwrap();
        assert!(pr.merged);
        assert_eq!(pr.status, PrStatus::Merged);
        assert_eq!(pr.merge_commit_sha.as_deref(), Some("m3rg3"));
    }

    #[tokio::test]
    async fn ci_pass_without_merge() {
        let fx = fixture(ExecBehavior::Succeed, CiBehavior::Pass);
        let state = run_pipeline(&fx, CancellationToken::new()).await;
        let snap = state.snapshot();
        assert_eq!(snap.step, "CI Passed");
        assert_eq!(snap.progress, "CI passed, merge skipped");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let fx = fixture(ExecBehavior::Succeed, CiBehavior::Disabled);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = run_pipeline(&fx, cancel).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Failed);
        assert!(snap.cancelled);
        assert!(snap.error.unwrap().starts_with("cancelled before start"));
        // Nothing was persisted.
        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        assert!(task.finalize_phase().is_none());
    }

    #[tokio::test]
    async fn cancelled_during_execution_records_phase() {
        let fx = fixture(ExecBehavior::Cancelled, CiBehavior::Disabled);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert!(snap.cancelled);
        assert!(snap.error.unwrap().starts_with("cancelled during execution"));
        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        assert_eq!(task.finalize_phase().unwrap().status, PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_after_sync_fails_run() {
        let mut fx = fixture(ExecBehavior::CancelThenSucceed, CiBehavior::Disabled);
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Failed);
        assert!(snap.cancelled);
        assert!(snap.error.unwrap().starts_with("cancelled after execution"));
        assert!(snap.result.is_none());

        let task = fx.project.store.load_task(&fx.task_id).await.unwrap();
        assert_eq!(task.finalize_phase().unwrap().status, PhaseStatus::Failed);
        assert!(!task.is_finalized());
        assert!(!fx.git.cleaned());
        assert!(progress_events(&mut fx)
            .iter()
            .all(|s| s.status != FinalizeStatus::Completed));
    }

    #[tokio::test]
    async fn missing_task_fails_run() {
        let fx = fixture(ExecBehavior::Succeed, CiBehavior::Disabled);
        fx.project.store.delete_task(&fx.task_id).await.unwrap();
        let state = run_pipeline(&fx, CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.status, FinalizeStatus::Failed);
        assert!(snap.error.unwrap().starts_with("load task"));
    }
}
