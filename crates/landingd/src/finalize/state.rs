//! Per-task finalize progress record.
//!
//! Mutable fields sit behind the record's own lock so progress readers
//! never contend with other tasks. Status only moves forward:
//! pending -> running -> completed | failed.

use chrono::{DateTime, Utc};
use landing_core::{FinalizeResult, FinalizeSnapshot, FinalizeStatus, Id};
use std::sync::{PoisonError, RwLock};

#[derive(Debug)]
struct Progress {
    status: FinalizeStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    step: String,
    progress: String,
    step_percent: u8,
    result: Option<FinalizeResult>,
    error: Option<String>,
    cancelled: bool,
}

/// Progress and outcome of one finalize run.
#[derive(Debug)]
pub struct FinalizeState {
    task_id: Id,
    inner: RwLock<Progress>,
}

impl FinalizeState {
    /// A pending run with an initial step label.
    pub fn new(task_id: Id, step: impl Into<String>, progress: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            inner: RwLock::new(Progress {
                status: FinalizeStatus::Pending,
                started_at: now,
                updated_at: now,
                step: step.into(),
                progress: progress.into(),
                step_percent: 0,
                result: None,
                error: None,
                cancelled: false,
            }),
        }
    }

    pub fn task_id(&self) -> &Id {
        &self.task_id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Progress> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Progress> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> FinalizeStatus {
        self.read().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.read().updated_at
    }

    pub fn snapshot(&self) -> FinalizeSnapshot {
        let p = self.read();
        FinalizeSnapshot {
            task_id: self.task_id.clone(),
            status: p.status,
            started_at: p.started_at,
            updated_at: p.updated_at,
            step: p.step.clone(),
            progress: p.progress.clone(),
            step_percent: p.step_percent,
            result: p.result.clone(),
            error: p.error.clone(),
            cancelled: p.cancelled,
        }
    }

    /// pending -> running. Returns false if the run already left pending.
    pub fn mark_running(&self, step: &str, progress: &str, percent: u8) -> bool {
        let mut p = self.write();
        if p.status != FinalizeStatus::Pending {
            return false;
        }
        p.status = FinalizeStatus::Running;
        Self::apply_step(&mut p, step, progress, percent);
        true
    }

    /// Update the step label of a running run. The percentage never decreases.
    pub fn progress(&self, step: &str, progress: &str, percent: u8) -> bool {
        let mut p = self.write();
        if p.status != FinalizeStatus::Running {
            return false;
        }
        Self::apply_step(&mut p, step, progress, percent);
        true
    }

    /// running -> completed at 100%.
    pub fn complete(&self, step: &str, progress: &str, result: FinalizeResult) -> bool {
        let mut p = self.write();
        if p.status != FinalizeStatus::Running {
            return false;
        }
        p.status = FinalizeStatus::Completed;
        Self::apply_step(&mut p, step, progress, 100);
        p.result = Some(result);
        true
    }

    /// pending | running -> failed.
    pub fn fail(&self, error: &str, cancelled: bool) -> bool {
        let mut p = self.write();
        if p.status.is_terminal() {
            return false;
        }
        p.status = FinalizeStatus::Failed;
        p.step = "Failed".to_string();
        p.progress = String::new();
        p.error = Some(error.to_string());
        p.cancelled = cancelled;
        p.updated_at = Utc::now();
        true
    }

    fn apply_step(p: &mut Progress, step: &str, progress: &str, percent: u8) {
        p.step = step.to_string();
        p.progress = progress.to_string();
        p.step_percent = p.step_percent.max(percent.min(100));
        p.updated_at = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn set_updated_at(&self, at: DateTime<Utc>) {
        self.write().updated_at = at;
    }
}
