//! Events broadcast to observers (UI, logs).
//!
//! Every event carries a typed payload; the wire form is
//! `{"id", "task_id", "timestamp", "type", "data"}`.

use crate::types::{FinalizeSnapshot, Id, PrStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kind names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PhaseChanged,
    Activity,
    SessionMetrics,
    Warning,
    Heartbeat,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    FinalizeProgress,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseChanged => "phase_changed",
            Self::Activity => "activity",
            Self::SessionMetrics => "session_metrics",
            Self::Warning => "warning",
            Self::Heartbeat => "heartbeat",
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::FinalizeProgress => "finalize_progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChangedPayload {
    pub phase: String,
    pub status: String,
}

/// Free-form progress line from a running phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetricsPayload {
    pub phase: String,
    pub duration_ms: u64,
    pub commands_run: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// PRs examined by the last poll tick.
    pub polled: u32,
    pub updated: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdatedPayload {
    pub status: TaskStatus,
    pub pr_status: PrStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeletedPayload {
    pub reason: String,
}

/// Closed set of event payloads, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    PhaseChanged(PhaseChangedPayload),
    Activity(ActivityPayload),
    SessionMetrics(SessionMetricsPayload),
    Warning(WarningPayload),
    Heartbeat(HeartbeatPayload),
    TaskCreated(TaskCreatedPayload),
    TaskUpdated(TaskUpdatedPayload),
    TaskDeleted(TaskDeletedPayload),
    FinalizeProgress(FinalizeSnapshot),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PhaseChanged(_) => EventType::PhaseChanged,
            Self::Activity(_) => EventType::Activity,
            Self::SessionMetrics(_) => EventType::SessionMetrics,
            Self::Warning(_) => EventType::Warning,
            Self::Heartbeat(_) => EventType::Heartbeat,
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskUpdated(_) => EventType::TaskUpdated,
            Self::TaskDeleted(_) => EventType::TaskDeleted,
            Self::FinalizeProgress(_) => EventType::FinalizeProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Id>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(task_id: Option<Id>, payload: EventPayload) -> Self {
        Self {
            id: Id::new(),
            task_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn for_task(task_id: &Id, payload: EventPayload) -> Self {
        Self::new(Some(task_id.clone()), payload)
    }

    pub fn finalize_progress(snapshot: FinalizeSnapshot) -> Self {
        let task_id = snapshot.task_id.clone();
        Self::new(Some(task_id), EventPayload::FinalizeProgress(snapshot))
    }

    pub fn task_updated(task: &Task) -> Self {
        Self::for_task(
            &task.id,
            EventPayload::TaskUpdated(TaskUpdatedPayload {
                status: task.status,
                pr_status: task.pr_status(),
            }),
        )
    }

    pub fn warning(task_id: Option<Id>, message: impl Into<String>) -> Self {
        Self::new(
            task_id,
            EventPayload::Warning(WarningPayload {
                message: message.into(),
            }),
        )
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
