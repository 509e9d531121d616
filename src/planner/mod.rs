//! Planning module.
//!
//! This module compares the desired configuration with the applied state
//! and sequences the steps of in-place updates.

mod diff;
mod sequencer;

pub use diff::{DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use sequencer::{
    AppliedSteps, CommitRecorder, NoopRecorder, SequenceOutcome, UpdatePlan, UpdateSequencer,
    UpdateStep,
};
