//! Finalize: sync a completed task into its target branch, then optionally
//! wait for CI and merge.
//!
//! The tracker is the exclusivity gate (one non-terminal run per task), the
//! pipeline is the per-run state machine, and the trigger is the entry point
//! used by the approval listener and the HTTP surface.

mod pipeline;
mod state;
mod tracker;
mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{FinalizeError, FinalizePipeline};
pub use state::FinalizeState;
pub use tracker::{FinalizeTracker, StartOutcome};
pub use trigger::{FinalizeTrigger, ManualTrigger, TriggerError};
