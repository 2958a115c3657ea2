//! Core types for the landing daemon.
//!
//! Tasks, their execution record and pull-request info are owned by the
//! storage collaborator; the finalize types describe one finalize run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the execution phase that finalize records into.
pub const FINALIZE_PHASE: &str = "finalize";

/// Unique identifier for tasks and events.
/// Freshly minted ids use `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
    Finalizing,
    Resolved,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Finalizing => "finalizing",
            Self::Resolved => "resolved",
        }
    }
}

/// Task weight, used for finalize eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
}

impl TaskWeight {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Status of a single execution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Review/merge status of a task's pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    #[default]
    None,
    Draft,
    PendingReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Draft => "draft",
            Self::PendingReview => "pending_review",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    /// Merged and closed PRs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Closed)
    }
}

// --- Task record ---

/// Progress of one named phase in a task's execution record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

/// Execution record: phase name to phase state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionState {
    pub phases: BTreeMap<String, PhaseState>,
    pub current_phase: Option<String>,
}

impl ExecutionState {
    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.get(name)
    }

    pub fn start_phase(&mut self, name: &str) {
        let phase = self.phases.entry(name.to_string()).or_default();
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
        phase.completed_at = None;
        phase.error = None;
        self.current_phase = Some(name.to_string());
    }

    pub fn complete_phase(&mut self, name: &str, commit_sha: Option<String>) {
        let phase = self.phases.entry(name.to_string()).or_default();
        phase.status = PhaseStatus::Completed;
        phase.completed_at = Some(Utc::now());
        phase.commit_sha = commit_sha;
        phase.error = None;
    }

    pub fn fail_phase(&mut self, name: &str, error: &str) {
        let phase = self.phases.entry(name.to_string()).or_default();
        phase.status = PhaseStatus::Failed;
        phase.completed_at = Some(Utc::now());
        phase.error = Some(error.to_string());
    }
}

/// Pull request information for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrInfo {
    pub url: String,
    pub number: Option<u64>,
    pub status: PrStatus,
    /// CI summary: pending, success, failure, unknown.
    pub checks_status: Option<String>,
    pub mergeable: bool,
    pub review_count: u32,
    pub approval_count: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub target_branch: Option<String>,
}

/// A unit of agent-executed development work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub title: String,
    pub status: TaskStatus,
    pub weight: TaskWeight,
    #[serde(default)]
    pub execution: ExecutionState,
    #[serde(default)]
    pub pr: Option<PrInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: Id, title: impl Into<String>, weight: TaskWeight) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            status: TaskStatus::Created,
            weight,
            execution: ExecutionState::default(),
            pr: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finalize_phase(&self) -> Option<&PhaseState> {
        self.execution.phase(FINALIZE_PHASE)
    }

    /// Whether the finalize phase is already recorded as completed.
    pub fn is_finalized(&self) -> bool {
        self.finalize_phase()
            .is_some_and(|p| p.status == PhaseStatus::Completed)
    }

    pub fn pr_status(&self) -> PrStatus {
        self.pr.as_ref().map_or(PrStatus::None, |pr| pr.status)
    }
}

// --- Finalize ---

/// Status of a finalize run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FinalizeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the pending -> running -> terminal order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

/// Merge risk derived from the size of the synced diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Classify by files changed, lines changed and conflicts resolved.
    pub fn classify(files: u32, lines: u32, conflicts: u32) -> Self {
        if files > 30 || lines > 1000 || conflicts > 10 {
            Self::Critical
        } else if files > 15 || lines > 500 || conflicts > 3 {
            Self::High
        } else if files > 5 || lines > 100 || conflicts > 0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Outcome of a completed finalize run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub synced: bool,
    pub conflicts_resolved: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_files: Vec<String>,
    pub tests_passed: bool,
    pub risk_level: RiskLevel,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub needs_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub target_branch: String,

    // CI and merge, populated only when CI was awaited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_error: Option<String>,
}

/// Point-in-time copy of a finalize run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeSnapshot {
    pub task_id: Id,
    pub status: FinalizeStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub step: String,
    pub progress: String,
    pub step_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the run failed because it was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

/// Finalize outcome recovered from the task's persisted finalize phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFinalize {
    pub task_id: Id,
    pub status: FinalizeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

impl PersistedFinalize {
    pub fn from_phase(task_id: Id, phase: &PhaseState) -> Self {
        let status = match phase.status {
            PhaseStatus::Completed => FinalizeStatus::Completed,
            PhaseStatus::Failed => FinalizeStatus::Failed,
            PhaseStatus::Running => FinalizeStatus::Running,
            PhaseStatus::Pending | PhaseStatus::Skipped => FinalizeStatus::Pending,
        };
        Self {
            task_id,
            status,
            started_at: phase.started_at,
            completed_at: phase.completed_at,
            commit_sha: phase.commit_sha.clone(),
            error: phase.error.clone(),
        }
    }
}

/// Sentinel for a task that has never been finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotStarted {
    pub task_id: Id,
    /// Always `not_started`.
    pub status: String,
    pub message: String,
}

impl NotStarted {
    pub fn new(task_id: Id) -> Self {
        Self {
            task_id,
            status: "not_started".to_string(),
            message: "No finalize operation found".to_string(),
        }
    }
}

/// Answer to a finalize status read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalizeView {
    Live(FinalizeSnapshot),
    Persisted(PersistedFinalize),
    NotStarted(NotStarted),
}

impl FinalizeView {
    pub fn status_str(&self) -> &str {
        match self {
            Self::Live(s) => s.status.as_str(),
            Self::Persisted(p) => p.status.as_str(),
            Self::NotStarted(n) => &n.status,
        }
    }
}
