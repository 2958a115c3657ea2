//! CI wait-and-merge.
//!
//! Pushes the task branch, polls `gh pr checks` until the checks settle or
//! the timeout expires, then optionally squash-merges the pull request.

use crate::git::Worktree;
use crate::github::{run_gh, PrClientError};
use async_trait::async_trait;
use landing_core::{Config, Task};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CiError {
    #[error("task has no pull request")]
    NoPullRequest,
    #[error("push failed: {0}")]
    Push(String),
    #[error("checks lookup failed: {0}")]
    Checks(String),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("pull request is not mergeable: {0}")]
    NotMergeable(String),
    #[error(transparent)]
    Gh(#[from] PrClientError),
    #[error("failed to execute git: {0}")]
    Io(#[from] std::io::Error),
    #[error("CI wait cancelled")]
    Cancelled,
}

/// What waiting for CI produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiOutcome {
    pub ci_passed: bool,
    pub details: String,
    pub merged: bool,
    pub merge_commit: Option<String>,
    pub timed_out: bool,
}

/// Waits for CI on a task's pull request and merges it when allowed.
#[async_trait]
pub trait CiMerger: Send + Sync {
    async fn wait_for_ci_and_merge(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        worktree: &Worktree,
    ) -> Result<CiOutcome, CiError>;
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub bucket: String,
}

/// Settled or unsettled state of a PR's checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChecksState {
    Passed(String),
    Failed(String),
    Pending,
}

pub(crate) fn summarize_checks(checks: &[CheckRun]) -> ChecksState {
    if checks.is_empty() {
        return ChecksState::Passed("No CI checks configured".to_string());
    }

    let failed: Vec<&str> = checks
        .iter()
        .filter(|c| matches!(c.bucket.as_str(), "fail" | "cancel"))
        .map(|c| c.name.as_str())
        .collect();
    if !failed.is_empty() {
        return ChecksState::Failed(format!("Failed checks: {}", failed.join(", ")));
    }

    if checks
        .iter()
        .all(|c| matches!(c.bucket.as_str(), "pass" | "skipping"))
    {
        ChecksState::Passed(format!("{} check(s) passed", checks.len()))
    } else {
        ChecksState::Pending
    }
}

/// `git push` + `gh` backed merger.
#[derive(Debug, Clone)]
pub struct GhCiMerger {
    program: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    merge_on_pass: bool,
}

impl GhCiMerger {
    pub fn new(config: &Config) -> Self {
        Self {
            program: PathBuf::from("gh"),
            timeout: config.ci_timeout(),
            poll_interval: config.ci_poll_interval(),
            merge_on_pass: config.should_merge_on_ci_pass(),
        }
    }

    /// Use a different `gh` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn push(&self, worktree: &Worktree) -> Result<(), CiError> {
        let output = Command::new("git")
            .args(["push", "--force-with-lease", "origin", &worktree.branch])
            .current_dir(&worktree.path)
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("Everything up-to-date") {
            return Ok(());
        }
        Err(CiError::Push(stderr.trim().to_string()))
    }

    async fn checks(&self, url: &str, dir: &Path) -> Result<ChecksState, CiError> {
        let output = run_gh(
            &self.program,
            &["pr", "checks", url, "--json", "name,state,bucket"],
            Some(dir),
        )
        .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // gh exits non-zero while checks are pending or failing; trust the JSON.
        if let Ok(checks) = serde_json::from_str::<Vec<CheckRun>>(stdout.trim()) {
            return Ok(summarize_checks(&checks));
        }
        if stderr.contains("no checks reported") {
            return Ok(summarize_checks(&[]));
        }
        Err(CiError::Checks(stderr.trim().to_string()))
    }

    async fn merge(&self, url: &str, dir: &Path) -> Result<Option<String>, CiError> {
        let output = run_gh(
            &self.program,
            &["pr", "merge", url, "--squash", "--delete-branch"],
            Some(dir),
        )
        .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.contains("already merged") {
            if stderr.contains("not mergeable") {
                return Err(CiError::NotMergeable(stderr.trim().to_string()));
            }
            return Err(CiError::Merge(stderr.trim().to_string()));
        }

        let view = run_gh(
            &self.program,
            &["pr", "view", url, "--json", "mergeCommit", "--jq", ".mergeCommit.oid"],
            Some(dir),
        )
        .await?;
        let sha = String::from_utf8_lossy(&view.stdout).trim().to_string();
        Ok((view.status.success() && !sha.is_empty()).then_some(sha))
    }
}

#[async_trait]
impl CiMerger for GhCiMerger {
    async fn wait_for_ci_and_merge(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        worktree: &Worktree,
    ) -> Result<CiOutcome, CiError> {
        let url = task
            .pr
            .as_ref()
            .map(|pr| pr.url.clone())
            .filter(|url| !url.is_empty())
            .ok_or(CiError::NoPullRequest)?;

        self.push(worktree).await?;
        info!(task_id = %task.id, branch = %worktree.branch, "branch pushed; waiting for CI");

        let deadline = Instant::now() + self.timeout;
        let details = loop {
            if cancel.is_cancelled() {
                return Err(CiError::Cancelled);
            }
            match self.checks(&url, &worktree.path).await? {
                ChecksState::Passed(details) => break details,
                ChecksState::Failed(details) => {
                    warn!(task_id = %task.id, details = %details, "CI failed");
                    return Ok(CiOutcome {
                        ci_passed: false,
                        details,
                        ..CiOutcome::default()
                    });
                }
                ChecksState::Pending => debug!(task_id = %task.id, "CI pending"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(task_id = %task.id, timeout_sec = self.timeout.as_secs(), "CI timed out");
                return Ok(CiOutcome {
                    ci_passed: false,
                    details: format!("CI timed out after {}s", self.timeout.as_secs()),
                    timed_out: true,
                    ..CiOutcome::default()
                });
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(CiError::Cancelled),
            }
        };

        info!(task_id = %task.id, details = %details, "CI passed");
        if !self.merge_on_pass {
            return Ok(CiOutcome {
                ci_passed: true,
                details,
                ..CiOutcome::default()
            });
        }

        let merge_commit = self.merge(&url, &worktree.path).await?;
        info!(task_id = %task.id, merge_commit = ?merge_commit, "pull request merged");
        Ok(CiOutcome {
            ci_passed: true,
            details,
            merged: true,
            merge_commit,
            timed_out: false,
        })
    }
}
