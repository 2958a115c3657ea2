//! Pull-request lookups through the GitHub CLI.
//!
//! `GhPrClient` shells out to `gh pr view` and condenses reviews and status
//! checks into a `ReviewSummary` for the PR poller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const PR_VIEW_FIELDS: &str = "state,isDraft,reviews,mergeable,statusCheckRollup,mergedAt,mergeCommit";

#[derive(Debug, Error)]
pub enum PrClientError {
    #[error("gh not found in PATH")]
    GhNotFound,
    #[error("gh command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute gh: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected gh output: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrClientError>;

/// Run the GitHub CLI and return its raw output.
pub(crate) async fn run_gh(program: &Path, args: &[&str], dir: Option<&Path>) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    debug!(args = ?args, "running gh");
    cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PrClientError::GhNotFound
        } else {
            PrClientError::Io(e)
        }
    })
}

/// Review outcome across all reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    PendingReview,
    Approved,
    ChangesRequested,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

/// External state of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrSnapshot {
    /// OPEN, MERGED or CLOSED.
    pub state: String,
    pub draft: bool,
    pub mergeable: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewSummary {
    pub review_status: ReviewStatus,
    pub review_count: u32,
    pub approval_count: u32,
    /// success, failure, pending or unknown.
    pub checks_status: String,
}

/// Pull-request state and review lookup keyed by URL.
#[async_trait]
pub trait PrClient: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(PrSnapshot, ReviewSummary)>;
}

// --- gh JSON shapes ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrView {
    state: String,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    reviews: Vec<Review>,
    #[serde(default)]
    mergeable: String,
    #[serde(default)]
    status_check_rollup: Vec<CheckContext>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merge_commit: Option<CommitRef>,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    oid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Review {
    #[serde(default)]
    author: Option<Author>,
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Author {
    login: String,
}

/// Either a check run (status + conclusion) or a commit status (state).
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct CheckContext {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// Latest decisive review per author; changes requested wins over approval.
pub(crate) fn summarize_reviews(reviews: &[Review]) -> (ReviewStatus, u32, u32) {
    let mut latest: HashMap<&str, &str> = HashMap::new();
    for review in reviews {
        let author = review.author.as_ref().map_or("", |a| a.login.as_str());
        match review.state.as_str() {
            "COMMENTED" | "PENDING" => {}
            "DISMISSED" => {
                latest.remove(author);
            }
            state => {
                latest.insert(author, state);
            }
        }
    }

    let approvals = latest.values().filter(|s| **s == "APPROVED").count() as u32;
    let status = if latest.values().any(|s| *s == "CHANGES_REQUESTED") {
        ReviewStatus::ChangesRequested
    } else if approvals > 0 {
        ReviewStatus::Approved
    } else {
        ReviewStatus::PendingReview
    };
    (status, latest.len() as u32, approvals)
}

pub(crate) fn summarize_rollup(checks: &[CheckContext]) -> String {
    if checks.is_empty() {
        return "unknown".to_string();
    }

    let mut pending = false;
    for check in checks {
        if let Some(conclusion) = check.conclusion.as_deref().filter(|c| !c.is_empty()) {
            if matches!(
                conclusion,
                "FAILURE" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED" | "STARTUP_FAILURE"
            ) {
                return "failure".to_string();
            }
        } else if let Some(state) = check.state.as_deref() {
            match state {
                "FAILURE" | "ERROR" => return "failure".to_string(),
                "PENDING" | "EXPECTED" => pending = true,
                _ => {}
            }
        } else if check.status.as_deref() != Some("COMPLETED") {
            pending = true;
        }
    }

    let summary = if pending { "pending" } else { "success" };
    summary.to_string()
}

pub(crate) fn parse_pr_view(json: &str) -> Result<(PrSnapshot, ReviewSummary)> {
    let view: PrView = serde_json::from_str(json)?;
    let (review_status, review_count, approval_count) = summarize_reviews(&view.reviews);
    let snapshot = PrSnapshot {
        state: view.state,
        draft: view.is_draft,
        mergeable: view.mergeable == "MERGEABLE",
        merged_at: view.merged_at,
        merge_commit: view.merge_commit.map(|c| c.oid),
    };
    let summary = ReviewSummary {
        review_status,
        review_count,
        approval_count,
        checks_status: summarize_rollup(&view.status_check_rollup),
    };
    Ok((snapshot, summary))
}

/// `gh pr view` backed client.
#[derive(Debug, Clone)]
pub struct GhPrClient {
    program: PathBuf,
}

impl GhPrClient {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("gh"),
        }
    }

    /// Use a different `gh` executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GhPrClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrClient for GhPrClient {
    async fn fetch(&self, url: &str) -> Result<(PrSnapshot, ReviewSummary)> {
        let output = run_gh(
            &self.program,
            &["pr", "view", url, "--json", PR_VIEW_FIELDS],
            None,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PrClientError::CommandFailed(format!(
                "gh pr view {url}: {}",
                stderr.trim()
            )));
        }
        parse_pr_view(&String::from_utf8_lossy(&output.stdout))
    }
}
