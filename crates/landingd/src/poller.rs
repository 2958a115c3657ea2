//! PR reconciliation poller.
//!
//! On every tick, tasks with an open pull request are re-checked through the
//! PR client. Status changes are persisted and handed to a `StatusListener`.
//! An unchanged status only refreshes `last_checked_at`.

use crate::github::{PrClient, PrClientError, PrSnapshot, ReviewStatus, ReviewSummary};
use crate::projects::{Project, ProjectRegistry};
use crate::publisher::EventPublisher;
use crate::storage::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use landing_core::events::HeartbeatPayload;
use landing_core::{Event, EventPayload, PrStatus, Task};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("PR lookup failed: {0}")]
    Client(#[from] PrClientError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Whether a task's PR is due for a re-check at `now`.
pub fn should_poll(task: &Task, min_recheck: Duration, now: DateTime<Utc>) -> bool {
    let Some(pr) = task.pr.as_ref() else {
        return false;
    };
    if pr.url.is_empty() || pr.status.is_terminal() {
        return false;
    }
    match pr.last_checked_at {
        // A timestamp in the future counts as just checked.
        Some(last) => match now.signed_duration_since(last).to_std() {
            Ok(elapsed) => elapsed >= min_recheck,
            Err(_) => false,
        },
        None => true,
    }
}

/// Map the external PR state and review summary onto a task PR status.
pub fn determine_pr_status(pr: &PrSnapshot, summary: &ReviewSummary) -> PrStatus {
    match pr.state.as_str() {
        "MERGED" => return PrStatus::Merged,
        "CLOSED" => return PrStatus::Closed,
        _ => {}
    }
    if pr.draft {
        return PrStatus::Draft;
    }
    match summary.review_status {
        ReviewStatus::PendingReview => PrStatus::PendingReview,
        ReviewStatus::Approved => PrStatus::Approved,
        ReviewStatus::ChangesRequested => PrStatus::ChangesRequested,
    }
}

/// Notified after a task's PR status change has been persisted.
#[async_trait]
pub trait StatusListener: Send + Sync {
    async fn on_status_change(&self, project_id: &str, task: &Task);
}

/// Counts from one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub polled: u32,
    pub updated: u32,
}

/// Fixed-interval PR status poller across all projects.
pub struct PrPoller {
    projects: Arc<ProjectRegistry>,
    client: Arc<dyn PrClient>,
    publisher: Arc<dyn EventPublisher>,
    listener: Option<Arc<dyn StatusListener>>,
    interval: Duration,
    started: AtomicBool,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PrPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrPoller")
            .field("interval", &self.interval)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PrPoller {
    /// The tick comes from the default project's `pr_poll_interval`.
    pub fn new(
        projects: Arc<ProjectRegistry>,
        client: Arc<dyn PrClient>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let interval = projects.default_project().config.pr_poll_interval();
        Self {
            projects,
            client,
            publisher,
            listener: None,
            interval,
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Spawn the poll loop. It runs until `token` is cancelled or `stop` is
    /// called. Starting twice, or after a stop, does nothing.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        if self.is_stopped() || self.started.swap(true, Ordering::SeqCst) {
            debug!("PR poller already started");
            return;
        }

        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_secs = poller.interval.as_secs(), "PR poller started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = poller.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = poller.poll_once().await;
                        debug!(polled = stats.polled, updated = stats.updated, "PR poll tick");
                    }
                }
            }
            info!("PR poller stopped");
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the loop. Safe to call any number of times, from any number of
    /// callers, before or after `start`.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the loop task to exit after a stop.
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "PR poller task failed");
            }
        }
    }

    /// One pass over every project's tasks.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        for project in self.projects.all() {
            let tasks = match project.store.load_all_tasks().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(project = %project.id, error = %e, "failed to load tasks for PR poll");
                    continue;
                }
            };

            let min_recheck = project.config.pr_min_recheck();
            let now = Utc::now();
            for task in tasks {
                if !should_poll(&task, min_recheck, now) {
                    continue;
                }
                stats.polled += 1;
                let task_id = task.id.clone();
                match self.poll_task(project, task).await {
                    Ok(true) => stats.updated += 1,
                    Ok(false) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "PR status check failed"),
                }
            }
        }

        self.publisher.publish(Event::new(
            None,
            EventPayload::Heartbeat(HeartbeatPayload {
                polled: stats.polled,
                updated: stats.updated,
            }),
        ));
        stats
    }

    /// Refresh one task's PR. Returns whether its status changed.
    ///
    /// The lookup can be slow, so the task is reloaded after it and only
    /// the PR fields of the fresh copy are written.
    async fn poll_task(&self, project: &Project, task: Task) -> Result<bool, PollError> {
        let Some(url) = task.pr.as_ref().map(|pr| pr.url.clone()) else {
            return Ok(false);
        };
        let (snapshot, summary) = self.client.fetch(&url).await?;
        let status = determine_pr_status(&snapshot, &summary);
        let now = Utc::now();

        let mut task = match project.store.load_task(&task.id).await {
            Ok(task) => task,
            Err(StorageError::TaskNotFound(_)) => {
                debug!(task_id = %task.id, "task deleted during PR lookup");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let Some(pr) = task.pr.as_mut().filter(|pr| pr.url == url) else {
            debug!(task_id = %task.id, "PR changed during lookup; skipping");
            return Ok(false);
        };
        pr.last_checked_at = Some(now);
        if pr.status == status {
            project.store.save_task(&task).await?;
            return Ok(false);
        }

        let previous = pr.status;
        pr.status = status;
        pr.review_count = summary.review_count;
        pr.approval_count = summary.approval_count;
        pr.checks_status = Some(summary.checks_status);
        pr.mergeable = snapshot.mergeable;
        if status == PrStatus::Merged {
            pr.merged = true;
            pr.merged_at = snapshot.merged_at.or(Some(now));
            if snapshot.merge_commit.is_some() {
                pr.merge_commit_sha = snapshot.merge_commit;
            }
        }
        task.updated_at = now;
        project.store.save_task(&task).await?;

        info!(
            task_id = %task.id,
            from = previous.as_str(),
            to = status.as_str(),
            "PR status changed"
        );
        if let Some(listener) = &self.listener {
            listener.on_status_change(&project.id, &task).await;
        }
        Ok(true)
    }
}
