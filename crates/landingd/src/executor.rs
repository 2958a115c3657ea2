//! Finalize executor: syncs a task branch with its target.
//!
//! Fetches the target, merges it into the task branch, runs the configured
//! test commands and sizes the resulting diff for risk assessment.

use crate::git::{self, GitError, Worktree};
use crate::publisher::EventPublisher;
use async_trait::async_trait;
use landing_core::events::{ActivityPayload, PhaseChangedPayload, SessionMetricsPayload};
use landing_core::{
    Config, Event, EventPayload, FinalizeResult, PhaseStatus, RiskLevel, Task, FINALIZE_PHASE,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest command output kept in an error message.
const MAX_ERROR_OUTPUT: usize = 4000;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Git(GitError),
    #[error("merge conflicts with {target}: {}", files.join(", "))]
    Conflict { target: String, files: Vec<String> },
    #[error("test command failed: {command}: {output}")]
    TestsFailed { command: String, output: String },
    #[error("failed to run test command: {0}")]
    Io(#[from] std::io::Error),
    #[error("execution cancelled")]
    Cancelled,
}

impl From<GitError> for ExecutorError {
    fn from(err: GitError) -> Self {
        Self::Git(err)
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Phase progress reported while the executor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub status: PhaseStatus,
    pub message: String,
}

/// Callback receiving phase progress.
pub type UpdateFn = Arc<dyn Fn(PhaseUpdate) + Send + Sync>;

/// Inputs for one execution.
#[derive(Clone)]
pub struct ExecutionContext {
    pub worktree: Worktree,
    pub target_branch: String,
    pub on_update: UpdateFn,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("worktree", &self.worktree)
            .field("target_branch", &self.target_branch)
            .finish_non_exhaustive()
    }
}

/// What a successful sync produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub commit_sha: String,
    /// Commits merged in from the target.
    pub commits_merged: u32,
    pub conflicts_resolved: u32,
    pub conflict_files: Vec<String>,
    pub tests_passed: bool,
    pub risk_level: RiskLevel,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub needs_review: bool,
    /// Human readable log of what was done, persisted as phase output.
    pub output: String,
}

impl SyncReport {
    pub fn into_result(self, target_branch: &str) -> FinalizeResult {
        FinalizeResult {
            synced: true,
            conflicts_resolved: self.conflicts_resolved,
            conflict_files: self.conflict_files,
            tests_passed: self.tests_passed,
            risk_level: self.risk_level,
            files_changed: self.files_changed,
            lines_changed: self.lines_changed,
            needs_review: self.needs_review,
            commit_sha: Some(self.commit_sha),
            target_branch: target_branch.to_string(),
            ..FinalizeResult::default()
        }
    }
}

/// Performs the branch sync for a finalize run.
#[async_trait]
pub trait FinalizeExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        ctx: ExecutionContext,
    ) -> Result<SyncReport>;
}

/// Git-backed executor.
pub struct GitFinalizeExecutor {
    test_cmds: Vec<String>,
    risk_assessment: bool,
    rereview_threshold: RiskLevel,
    publisher: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for GitFinalizeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitFinalizeExecutor")
            .field("test_cmds", &self.test_cmds)
            .field("risk_assessment", &self.risk_assessment)
            .field("rereview_threshold", &self.rereview_threshold)
            .finish_non_exhaustive()
    }
}

impl GitFinalizeExecutor {
    pub fn new(config: &Config, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            test_cmds: config.finalize_test_cmds.clone(),
            risk_assessment: config.finalize_risk_assessment,
            rereview_threshold: config.finalize_rereview_threshold,
            publisher,
        }
    }

    fn activity(&self, task: &Task, message: &str) {
        self.publisher.publish(Event::for_task(
            &task.id,
            EventPayload::Activity(ActivityPayload {
                phase: FINALIZE_PHASE.to_string(),
                message: message.to_string(),
            }),
        ));
    }

    fn phase_changed(&self, task: &Task, status: PhaseStatus) {
        self.publisher.publish(Event::for_task(
            &task.id,
            EventPayload::PhaseChanged(PhaseChangedPayload {
                phase: FINALIZE_PHASE.to_string(),
                status: status.as_str().to_string(),
            }),
        ));
    }

    /// Run one test command in the worktree, killing it on cancellation.
    async fn run_test_command(
        &self,
        cancel: &CancellationToken,
        ctx: &ExecutionContext,
        command: &str,
    ) -> Result<()> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.worktree.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            () = cancel.cancelled() => {
                info!(command, "cancellation requested; killing test command");
                return Err(ExecutorError::Cancelled);
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            combined.push_str("\n--- STDERR ---\n");
            combined.push_str(&stderr);
        }
        Err(ExecutorError::TestsFailed {
            command: command.to_string(),
            output: tail(&combined, MAX_ERROR_OUTPUT),
        })
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.trim().to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim().to_string()
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ExecutorError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl FinalizeExecutor for GitFinalizeExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        ctx: ExecutionContext,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let dir = ctx.worktree.path.as_path();
        let target = ctx.target_branch.as_str();
        let mut log = Vec::new();
        let mut commands_run = 0u32;

        self.phase_changed(task, PhaseStatus::Running);
        (ctx.on_update)(PhaseUpdate {
            status: PhaseStatus::Running,
            message: format!("Syncing {} with {target}", ctx.worktree.branch),
        });

        let target_ref = git::fetch_target(dir, target).await?;
        let behind = git::commits_between(dir, "HEAD", &target_ref).await?;
        debug!(task_id = %task.id, target_ref = %target_ref, behind, "target fetched");
        log.push(format!("{behind} commit(s) behind {target_ref}"));

        check_cancel(cancel)?;
        if behind > 0 {
            self.activity(task, &format!("Merging {behind} commit(s) from {target_ref}"));
            match git::merge_branch(dir, &target_ref).await {
                Ok(()) => log.push(format!("merged {target_ref}")),
                Err(GitError::MergeConflict { files, .. }) => {
                    warn!(task_id = %task.id, files = ?files, "merge conflict");
                    return Err(ExecutorError::Conflict {
                        target: target_ref,
                        files,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        for command in &self.test_cmds {
            check_cancel(cancel)?;
            self.activity(task, &format!("Running {command}"));
            self.run_test_command(cancel, &ctx, command).await?;
            commands_run += 1;
            log.push(format!("passed: {command}"));
        }

        check_cancel(cancel)?;
        let stat = git::diff_stat(dir, &target_ref).await?;
        let (risk_level, needs_review) = if self.risk_assessment {
            let level = RiskLevel::classify(stat.files, stat.lines, 0);
            (level, level >= self.rereview_threshold)
        } else {
            (RiskLevel::Unknown, false)
        };
        log.push(format!(
            "{} file(s), {} line(s) changed; risk {}",
            stat.files,
            stat.lines,
            risk_level.as_str()
        ));

        let commit_sha = git::head_sha(dir).await?;

        (ctx.on_update)(PhaseUpdate {
            status: PhaseStatus::Completed,
            message: format!("Synced with {target}"),
        });
        self.phase_changed(task, PhaseStatus::Completed);
        self.publisher.publish(Event::for_task(
            &task.id,
            EventPayload::SessionMetrics(SessionMetricsPayload {
                phase: FINALIZE_PHASE.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                commands_run,
            }),
        ));

        info!(
            task_id = %task.id,
            commit_sha = %commit_sha,
            risk = risk_level.as_str(),
            "sync complete"
        );

        Ok(SyncReport {
            commit_sha,
            commits_merged: behind,
            conflicts_resolved: 0,
            conflict_files: Vec::new(),
            tests_passed: true,
            risk_level,
            files_changed: stat.files,
            lines_changed: stat.lines,
            needs_review,
            output: log.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, run, setup_test_repo};
    use crate::publisher::Broadcaster;
    use landing_core::{EventType, Id, TaskWeight};
    use std::sync::Mutex;

    fn context(dir: &std::path::Path, updates: Arc<Mutex<Vec<PhaseUpdate>>>) -> ExecutionContext {
        ExecutionContext {
            worktree: Worktree {
                path: dir.to_path_buf(),
                branch: "feature".to_string(),
            },
            target_branch: "main".to_string(),
            on_update: Arc::new(move |u| updates.lock().unwrap().push(u)),
        }
    }

    fn executor(test_cmds: Vec<String>, broadcaster: &Broadcaster) -> GitFinalizeExecutor {
        let config = Config {
            finalize_test_cmds: test_cmds,
            ..Config::default()
        };
        GitFinalizeExecutor::new(&config, Arc::new(broadcaster.clone()))
    }

    /// Repo on `feature` one commit behind `main`, with its own change.
    fn diverged_repo() -> tempfile::TempDir {
        let dir = setup_test_repo();
        run(dir.path(), &["branch", "feature"]);
        commit_file(dir.path(), "upstream.txt", "upstream\n", "upstream change");
        run(dir.path(), &["checkout", "feature"]);
        commit_file(dir.path(), "feature.txt", "a\nb\nc\n", "feature change");
        dir
    }

    #[tokio::test]
    async fn execute_merges_target_and_reports() {
        let dir = diverged_repo();
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let task = Task::new(Id::from_string("TASK-1"), "t", TaskWeight::Medium);

        let report = executor(vec!["test -f upstream.txt".to_string()], &broadcaster)
            .execute(&CancellationToken::new(), &task, context(dir.path(), Arc::clone(&updates)))
            .await
            .unwrap();

        assert!(dir.path().join("upstream.txt").exists());
        assert_eq!(report.commits_merged, 1);
        assert!(report.tests_passed);
        assert_eq!(report.files_changed, 1);
        assert_eq!(report.lines_changed, 3);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(!report.needs_review);
        assert_eq!(report.commit_sha.len(), 40);

        let statuses: Vec<_> = updates.lock().unwrap().iter().map(|u| u.status).collect();
        assert_eq!(statuses, vec![PhaseStatus::Running, PhaseStatus::Completed]);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert!(kinds.contains(&EventType::PhaseChanged));
        assert!(kinds.contains(&EventType::Activity));
        assert!(kinds.contains(&EventType::SessionMetrics));
    }

    #[tokio::test]
    async fn execute_fails_on_conflict() {
        let dir = setup_test_repo();
        run(dir.path(), &["branch", "feature"]);
        commit_file(dir.path(), "README.md", "# Main\n", "main edit");
        run(dir.path(), &["checkout", "feature"]);
        commit_file(dir.path(), "README.md", "# Feature\n", "feature edit");
        let task = Task::new(Id::new(), "t", TaskWeight::Small);

        let err = executor(Vec::new(), &Broadcaster::default())
            .execute(
                &CancellationToken::new(),
                &task,
                context(dir.path(), Arc::new(Mutex::new(Vec::new()))),
            )
            .await
            .unwrap_err();

        match err {
            ExecutorError::Conflict { files, .. } => assert_eq!(files, vec!["README.md"]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_fails_when_tests_fail() {
        let dir = diverged_repo();
        let task = Task::new(Id::new(), "t", TaskWeight::Small);

        let err = executor(vec!["echo broken >&2; exit 3".to_string()], &Broadcaster::default())
            .execute(
                &CancellationToken::new(),
                &task,
                context(dir.path(), Arc::new(Mutex::new(Vec::new()))),
            )
            .await
            .unwrap_err();

        match err {
            ExecutorError::TestsFailed { output, .. } => assert!(output.contains("broken")),
            other => panic!("expected test failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_observes_cancellation() {
        let dir = diverged_repo();
        let task = Task::new(Id::new(), "t", TaskWeight::Small);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor(Vec::new(), &Broadcaster::default())
            .execute(&cancel, &task, context(dir.path(), Arc::new(Mutex::new(Vec::new()))))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[test]
    fn tail_keeps_end_of_output() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("0123456789abc", 3), "abc");
    }
}
