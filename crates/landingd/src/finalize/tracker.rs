//! Registry of finalize runs and their cancellation handles.
//!
//! One registry-level lock guards both maps; it is held for a single map
//! operation and never across an `.await` or a collaborator call.

use super::state::FinalizeState;
use chrono::Utc;
use landing_core::Id;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of an exclusive start.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started,
    /// A non-terminal run already exists for the task.
    InFlight(Arc<FinalizeState>),
}

impl StartOutcome {
    pub fn started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// A cancellation token tagged with the run it belongs to, so a finished
/// run can only release its own handle.
#[derive(Debug)]
struct CancelHandle {
    run: Option<Arc<FinalizeState>>,
    token: CancellationToken,
}

impl CancelHandle {
    fn owned_by(&self, run: &Arc<FinalizeState>) -> bool {
        self.run.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, run))
    }
}

#[derive(Debug, Default)]
struct Registry {
    states: HashMap<Id, Arc<FinalizeState>>,
    cancels: HashMap<Id, CancelHandle>,
}

impl Registry {
    fn in_flight(&self, task_id: &Id) -> Option<Arc<FinalizeState>> {
        self.states
            .get(task_id)
            .filter(|existing| !existing.is_terminal())
            .cloned()
    }
}

/// Process-wide finalize registry, shared by `Arc`.
#[derive(Debug, Default)]
pub struct FinalizeTracker {
    inner: RwLock<Registry>,
}

impl FinalizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `state` unless a non-terminal run exists for its task.
    ///
    /// This is the exclusivity gate: check and insert happen under one
    /// write lock, so concurrent callers for the same task see exactly one
    /// `Started`.
    pub fn try_start(&self, state: Arc<FinalizeState>) -> StartOutcome {
        let mut reg = self.write();
        if let Some(existing) = reg.in_flight(state.task_id()) {
            return StartOutcome::InFlight(existing);
        }
        reg.states.insert(state.task_id().clone(), state);
        StartOutcome::Started
    }

    /// `try_start` that also registers the run's cancellation handle under
    /// the same lock, so a cancel arriving right after `Started` always
    /// finds it. On `InFlight` the token is not registered.
    pub fn try_start_with_cancel(
        &self,
        state: Arc<FinalizeState>,
        token: CancellationToken,
    ) -> StartOutcome {
        let mut reg = self.write();
        if let Some(existing) = reg.in_flight(state.task_id()) {
            return StartOutcome::InFlight(existing);
        }
        let task_id = state.task_id().clone();
        reg.cancels.insert(
            task_id.clone(),
            CancelHandle {
                run: Some(Arc::clone(&state)),
                token,
            },
        );
        reg.states.insert(task_id, state);
        StartOutcome::Started
    }

    pub fn get(&self, task_id: &Id) -> Option<Arc<FinalizeState>> {
        self.read().states.get(task_id).cloned()
    }

    /// Replace the state for a task. For callers that already own the run.
    pub fn set(&self, state: Arc<FinalizeState>) {
        self.write().states.insert(state.task_id().clone(), state);
    }

    pub fn delete(&self, task_id: &Id) -> Option<Arc<FinalizeState>> {
        self.write().states.remove(task_id)
    }

    /// Remove a task's entry only if its run has finished. A pending or
    /// running entry stays so the task keeps its exclusivity until the run
    /// ends.
    pub fn delete_terminal(&self, task_id: &Id) -> Option<Arc<FinalizeState>> {
        let mut reg = self.write();
        if reg.in_flight(task_id).is_some() {
            return None;
        }
        reg.states.remove(task_id)
    }

    /// Register a cancellation handle for the task's current run.
    pub fn set_cancel(&self, task_id: &Id, token: CancellationToken) {
        let mut reg = self.write();
        let run = reg.states.get(task_id).cloned();
        reg.cancels.insert(task_id.clone(), CancelHandle { run, token });
    }

    /// Cancel a task's run. The handle is removed before it fires, so any
    /// number of calls (concurrent or not) cancel at most once. Unknown ids
    /// are a no-op.
    pub fn cancel(&self, task_id: &Id) -> bool {
        let handle = self.write().cancels.remove(task_id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                debug!(task_id = %task_id, "finalize cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop `run`'s cancellation handle without firing it. A handle that
    /// belongs to a newer run of the same task is left alone.
    pub fn release(&self, run: &Arc<FinalizeState>) {
        let mut reg = self.write();
        if reg
            .cancels
            .get(run.task_id())
            .is_some_and(|handle| handle.owned_by(run))
        {
            reg.cancels.remove(run.task_id());
        }
    }

    pub fn has_cancel(&self, task_id: &Id) -> bool {
        self.read().cancels.contains_key(task_id)
    }

    /// Cancel every registered run.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = {
            let mut reg = self.write();
            reg.cancels.drain().map(|(_, handle)| handle.token).collect()
        };
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Remove terminal entries last updated more than `retention` ago.
    /// Pending and running entries are never removed.
    pub fn cleanup_stale(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut reg = self.write();
        let before = reg.states.len();
        reg.states
            .retain(|_, state| !(state.is_terminal() && state.updated_at() < cutoff));
        before - reg.states.len()
    }

    /// Run `cleanup_stale` every `interval` until `token` is cancelled.
    pub fn start_cleanup(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        retention: Duration,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("finalize cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = tracker.cleanup_stale(retention);
                        if removed > 0 {
                            info!(removed, "removed stale finalize states");
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.read().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
