//! Ordered partial-update sequencer.
//!
//! An update is a set of independent steps, each one or more remote calls.
//! Steps run in a fixed order regardless of how they were planned, every
//! completed step is recorded before the next one starts, and steps already
//! recorded by an earlier attempt are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::drivers::ResourceKind;
use crate::error::{ReconcileError, Result};
use crate::one::{RemoteCall, RemoteSession};

/// One independently applied part of an update, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStep {
    /// Description or template body.
    Body,
    /// Rename.
    Rename,
    /// Address-range resize.
    AddressRange,
    /// Security-group membership.
    SecurityGroups,
    /// Owner and group.
    Ownership,
    /// Permission bits.
    Permissions,
    /// Propagation to dependent objects.
    CommitDependents,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Body => "description",
            Self::Rename => "rename",
            Self::AddressRange => "address range",
            Self::SecurityGroups => "security groups",
            Self::Ownership => "ownership",
            Self::Permissions => "permissions",
            Self::CommitDependents => "commit",
        };
        write!(f, "{s}")
    }
}

/// Steps already applied for the current target configuration.
pub type AppliedSteps = BTreeSet<UpdateStep>;

/// The calls an update needs, grouped by step.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Numeric ID.
    pub id: i64,
    steps: BTreeMap<UpdateStep, Vec<RemoteCall>>,
}

impl UpdatePlan {
    /// Creates an empty plan.
    #[must_use]
    pub const fn new(kind: ResourceKind, id: i64) -> Self {
        Self {
            kind,
            id,
            steps: BTreeMap::new(),
        }
    }

    /// Adds a call to a step. Calls within one step keep insertion order.
    pub fn add(&mut self, step: UpdateStep, call: RemoteCall) {
        self.steps.entry(step).or_default().push(call);
    }

    /// Adds a call to a step, builder style.
    #[must_use]
    pub fn with(mut self, step: UpdateStep, call: RemoteCall) -> Self {
        self.add(step, call);
        self
    }

    /// Returns true when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the planned steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = UpdateStep> + '_ {
        self.steps.keys().copied()
    }

    /// Returns the calls planned for one step.
    #[must_use]
    pub fn calls(&self, step: UpdateStep) -> &[RemoteCall] {
        self.steps.get(&step).map_or(&[], Vec::as_slice)
    }
}

/// Durable storage for commit markers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommitRecorder: Send + Sync {
    /// Persists the set of applied steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the markers cannot be stored.
    async fn record(&self, applied: &AppliedSteps) -> Result<()>;
}

/// A recorder that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl CommitRecorder for NoopRecorder {
    async fn record(&self, _applied: &AppliedSteps) -> Result<()> {
        Ok(())
    }
}

/// What a sequencer run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceOutcome {
    /// Steps executed in this run.
    pub executed: Vec<UpdateStep>,
    /// Steps skipped because an earlier run applied them.
    pub skipped: Vec<UpdateStep>,
}

/// Runs update plans against a session.
#[derive(Clone, Copy)]
pub struct UpdateSequencer<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> UpdateSequencer<'a> {
    /// Creates a sequencer.
    #[must_use]
    pub const fn new(session: &'a dyn RemoteSession) -> Self {
        Self { session }
    }

    /// Executes a plan.
    ///
    /// `applied` holds the steps recorded by earlier attempts at the same
    /// target; it is updated and passed to `recorder` after each step.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::PartialUpdate`] naming the first step that
    /// did not complete, or the recorder's error. Earlier steps stay applied.
    pub async fn run(
        &self,
        plan: &UpdatePlan,
        applied: &mut AppliedSteps,
        recorder: &dyn CommitRecorder,
    ) -> Result<SequenceOutcome> {
        let mut outcome = SequenceOutcome::default();

        for step in plan.steps() {
            if applied.contains(&step) {
                debug!("{} {}: step '{step}' already applied", plan.kind, plan.id);
                outcome.skipped.push(step);
                continue;
            }

            for call in plan.calls(step) {
                debug!("{} {}: {call}", plan.kind, plan.id);
                if let Err(e) = call.send(self.session).await {
                    return Err(ReconcileError::PartialUpdate {
                        kind: plan.kind,
                        id: plan.id,
                        step: step.to_string(),
                        applied: applied.iter().map(ToString::to_string).collect(),
                        reason: e.to_string(),
                    }
                    .into());
                }
            }

            applied.insert(step);
            recorder.record(applied).await?;
            info!("{} {}: applied '{step}'", plan.kind, plan.id);
            outcome.executed.push(step);
        }

        Ok(outcome)
    }
}
