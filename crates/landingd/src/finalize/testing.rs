//! Scripted collaborators for finalize tests.

use super::tracker::FinalizeTracker;
use crate::ci::{CiError, CiMerger, CiOutcome};
use crate::executor::{
    ExecutionContext, ExecutorError, FinalizeExecutor, PhaseUpdate, Result as ExecResult,
    SyncReport,
};
use crate::git::{GitService, Result as GitResult, Worktree};
use crate::projects::Project;
use crate::publisher::{Broadcaster, EventPublisher};
use crate::storage::{MemoryStore, TaskStore};
use async_trait::async_trait;
use landing_core::config::Profile;
use landing_core::{
    Config, Event, Id, PhaseStatus, PrInfo, PrStatus, RiskLevel, Task, TaskStatus, TaskWeight,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub(crate) const TASK_ID: &str = "TASK-1";

#[derive(Debug, Default)]
pub(crate) struct FakeGit {
    cleaned: AtomicBool,
}

impl FakeGit {
    pub fn cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitService for FakeGit {
    async fn prepare(&self, work_dir: &Path, task: &Task) -> GitResult<Worktree> {
        Ok(Worktree {
            path: work_dir.join(".landing/worktrees").join(task.id.as_ref()),
            branch: format!("landing/{}", task.id),
        })
    }

    async fn cleanup(&self, _work_dir: &Path, _task_id: &Id) -> GitResult<()> {
        self.cleaned.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecBehavior {
    Succeed,
    Fail,
    Cancelled,
    /// Hold the run open until its token fires.
    BlockUntilCancelled,
    /// Cancellation lands while the sync finishes successfully.
    CancelThenSucceed,
}

#[derive(Debug)]
pub(crate) struct FakeExecutor {
    behavior: ExecBehavior,
    pub calls: AtomicUsize,
}

#[async_trait]
impl FinalizeExecutor for FakeExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        _task: &Task,
        ctx: ExecutionContext,
    ) -> ExecResult<SyncReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (ctx.on_update)(PhaseUpdate {
            status: PhaseStatus::Running,
            message: format!("Merging {} into task branch", ctx.target_branch),
        });
        match self.behavior {
            ExecBehavior::Succeed => {}
            ExecBehavior::Fail => {
                return Err(ExecutorError::Conflict {
                    target: ctx.target_branch,
                    files: vec!["src/lib.rs".to_string()],
                });
            }
            ExecBehavior::Cancelled => return Err(ExecutorError::Cancelled),
            ExecBehavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                return Err(ExecutorError::Cancelled);
            }
            ExecBehavior::CancelThenSucceed => cancel.cancel(),
        }
        (ctx.on_update)(PhaseUpdate {
            status: PhaseStatus::Completed,
            message: "Sync complete".to_string(),
        });
        Ok(SyncReport {
            commit_sha: "abc123".to_string(),
            commits_merged: 2,
            tests_passed: true,
            risk_level: RiskLevel::Low,
            files_changed: 3,
            lines_changed: 40,
            output: "merged 2 commits".to_string(),
            ..SyncReport::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CiBehavior {
    /// Profile does not wait for CI.
    Disabled,
    Pass,
    Merge,
    Error,
}

#[derive(Debug)]
pub(crate) struct FakeCi {
    behavior: CiBehavior,
}

#[async_trait]
impl CiMerger for FakeCi {
    async fn wait_for_ci_and_merge(
        &self,
        _cancel: &CancellationToken,
        _task: &Task,
        _worktree: &Worktree,
    ) -> Result<CiOutcome, CiError> {
        match self.behavior {
            CiBehavior::Disabled => Err(CiError::Checks("CI is disabled".to_string())),
            CiBehavior::Pass => Ok(CiOutcome {
                ci_passed: true,
                details: "All checks passed".to_string(),
                ..CiOutcome::default()
            }),
            CiBehavior::Merge => Ok(CiOutcome {
                ci_passed: true,
                details: "All checks passed".to_string(),
                merged: true,
                merge_commit: Some("m3rg3".to_string()),
                timed_out: false,
            }),
            CiBehavior::Error => Err(CiError::Push("rejected".to_string())),
        }
    }
}

pub(crate) fn completed_task(id: &str) -> Task {
    let mut task = Task::new(Id::from_string(id), "Add login flow", TaskWeight::Medium);
    task.status = TaskStatus::Completed;
    task.pr = Some(PrInfo {
        url: format!("https://github.com/acme/app/pull/{}", id.len()),
        status: PrStatus::Approved,
        ..PrInfo::default()
    });
    task
}

pub(crate) struct Fixture {
    pub project: Project,
    pub tracker: Arc<FinalizeTracker>,
    pub broadcaster: Arc<Broadcaster>,
    pub events: broadcast::Receiver<Event>,
    pub git: Arc<FakeGit>,
    pub executor: Arc<FakeExecutor>,
    pub task_id: Id,
}

impl Fixture {
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        Arc::clone(&self.broadcaster) as Arc<dyn EventPublisher>
    }
}

pub(crate) fn project_with(
    config: Config,
    store: Arc<dyn TaskStore>,
    exec: ExecBehavior,
    ci: CiBehavior,
) -> (Project, Arc<FakeGit>, Arc<FakeExecutor>) {
    let git = Arc::new(FakeGit::default());
    let executor = Arc::new(FakeExecutor {
        behavior: exec,
        calls: AtomicUsize::new(0),
    });
    let project = Project {
        id: "default".to_string(),
        work_dir: PathBuf::from("/work/app"),
        config: Arc::new(config),
        store,
        git: Arc::clone(&git) as Arc<dyn GitService>,
        executor: Arc::clone(&executor) as Arc<dyn FinalizeExecutor>,
        ci: Arc::new(FakeCi { behavior: ci }),
    };
    (project, git, executor)
}

pub(crate) fn config_for(ci: CiBehavior) -> Config {
    Config {
        profile: if ci == CiBehavior::Disabled {
            Profile::Strict
        } else {
            Profile::Auto
        },
        ..Config::default()
    }
}

pub(crate) fn fixture(exec: ExecBehavior, ci: CiBehavior) -> Fixture {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::with_tasks([completed_task(TASK_ID)]));
    let (project, git, executor) = project_with(config_for(ci), store, exec, ci);
    let broadcaster = Arc::new(Broadcaster::default());
    let events = broadcaster.subscribe();
    Fixture {
        project,
        tracker: Arc::new(FinalizeTracker::new()),
        broadcaster,
        events,
        git,
        executor,
        task_id: Id::from_string(TASK_ID),
    }
}
