//! Reconciler for converging remote objects on the configuration.
//!
//! One run reads every recorded resource, diffs the configuration against
//! the applied state, and executes the diff one resource at a time in
//! declaration order. The state is saved after every resource and after
//! every committed update step, so an interrupted run resumes where it
//! stopped.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DeployConfig, ResourceConfig};
use crate::drivers::{AllocationRecorder, Drivers, ResourceKind, ResourceSummary};
use crate::error::{NebulaError, ReconcileError, Result};
use crate::planner::{AppliedSteps, CommitRecorder, DiffEngine, DiffResult, DiffType, ResourceDiff};
use crate::state::{HistoryEntry, Operation, ReconcileState, ResourceRecord, StateStore};

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a DeployConfig,
    /// State store.
    state_store: &'a S,
    /// Per-kind drivers.
    drivers: Drivers<'a>,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
}

/// Result of a reconciliation run.
#[derive(Debug, Default, serde::Serialize)]
pub struct ReconciliationResult {
    /// Whether every planned action succeeded.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated in place.
    pub updated: usize,
    /// Number of resources replaced.
    pub replaced: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources unchanged.
    pub unchanged: usize,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Settled projections of the resources created, updated or replaced.
    pub resources: Vec<ResourceSummary>,
    /// Final state after reconciliation.
    #[serde(skip)]
    pub final_state: Option<ReconcileState>,
}

/// Persists commit markers into the state file.
struct StateRecorder<'s, S: StateStore> {
    store: &'s S,
    state: &'s Mutex<ReconcileState>,
    key: &'s str,
    target_hash: &'s str,
}

#[async_trait]
impl<S: StateStore> CommitRecorder for StateRecorder<'_, S> {
    async fn record(&self, applied: &AppliedSteps) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.get_mut(self.key) {
            record.mark_pending(self.target_hash, applied);
        }
        self.store.save(&state).await
    }
}

/// Persists a freshly allocated object as tainted until it settles.
struct AllocationWriter<'s, S: StateStore> {
    store: &'s S,
    state: &'s Mutex<ReconcileState>,
    key: &'s str,
    config: &'s ResourceConfig,
    hash: &'s str,
}

#[async_trait]
impl<S: StateStore> AllocationRecorder for AllocationWriter<'_, S> {
    async fn allocated(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.set(ResourceRecord::allocated(self.key, id, self.config.clone(), self.hash));
        self.store.save(&state).await
    }
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub const fn new(config: &'a DeployConfig, state_store: &'a S, drivers: Drivers<'a>) -> Self {
        Self {
            config,
            state_store,
            drivers,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Computes what `apply` would do, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns state and read errors.
    pub async fn plan(&self) -> Result<DiffResult> {
        let state = self.load_state().await?;
        let observed = self.observe(&state).await?;
        Ok(self.diff(&state, &observed))
    }

    /// Converges every configured resource.
    ///
    /// The state lock is held for the whole run and refreshed before each
    /// resource.
    ///
    /// # Errors
    ///
    /// Returns lock, state and read errors. Failures of individual actions
    /// are reported in the result.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        let lock = self.state_store.acquire_lock("").await?;
        debug!("Holding {} state lock {}", self.state_store.backend_type(), lock.lock_id);
        let result = self.apply_locked(&lock.lock_id).await;
        self.state_store.release_lock(&lock.lock_id).await?;
        result
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns lock and state errors. Failures of individual deletes are
    /// reported in the result.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        let lock = self.state_store.acquire_lock("").await?;
        let result = self.destroy_locked(&lock.lock_id).await;
        self.state_store.release_lock(&lock.lock_id).await?;
        result
    }

    /// Resolves the configured users and groups.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::NotFound`] for an unknown account, or the
    /// read error.
    pub async fn lookups(&self) -> Result<Vec<ResourceSummary>> {
        let references = self
            .config
            .users
            .iter()
            .map(|r| (ResourceKind::User, r))
            .chain(self.config.groups.iter().map(|r| (ResourceKind::Group, r)));

        let mut found = Vec::new();
        for (kind, reference) in references {
            let summary = self
                .drivers
                .read_reference(kind, reference)
                .await?
                .ok_or_else(|| ReconcileError::NotFound {
                    kind,
                    reference: reference.clone(),
                })?;
            found.push(summary);
        }
        Ok(found)
    }

    async fn load_state(&self) -> Result<ReconcileState> {
        Ok(self
            .state_store
            .load()
            .await?
            .unwrap_or_else(|| ReconcileState::new(&self.config.provider.endpoint)))
    }

    /// Reads the remote object behind every recorded, still configured resource.
    async fn observe(&self, state: &ReconcileState) -> Result<HashMap<String, ResourceSummary>> {
        let configured: Vec<String> = self
            .config
            .keyed_resources()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let mut observed = HashMap::new();

        for (key, record) in &state.resources {
            if !configured.contains(key) {
                continue;
            }
            match self
                .drivers
                .read(record.kind, Some(record.id), record.lookup_name())
                .await?
            {
                Some(summary) => {
                    debug!("{key}: {} {}", summary.id, summary.status);
                    observed.insert(key.clone(), summary);
                }
                None => warn!("{key} (ID {}) no longer exists", record.id),
            }
        }

        debug!("Observed {} of {} recorded resources", observed.len(), state.resources.len());
        Ok(observed)
    }

    fn diff(&self, state: &ReconcileState, observed: &HashMap<String, ResourceSummary>) -> DiffResult {
        let diff = self.diff_engine.compute_diff(self.config, Some(state), observed, |old, new| {
            self.drivers.requires_replacement(old, new)
        });

        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );
        diff
    }

    async fn apply_locked(&self, lock_id: &str) -> Result<ReconciliationResult> {
        let config_hash = self.hasher.hash_config(self.config);
        let state = self.load_state().await?;
        let observed = self.observe(&state).await?;
        let diff = self.diff(&state, &observed);

        if !diff.has_changes() {
            info!("No changes required - state is converged");
        }

        let state = Mutex::new(state);
        let mut result = self.execute(&diff, &state, lock_id, Operation::Apply).await;

        let mut state = state.into_inner();
        if result.success {
            state.config_hash.clone_from(&config_hash);
        }
        state.add_history(history_entry(Operation::Apply, &config_hash, &diff, &result));
        self.state_store.save(&state).await?;

        result.final_state = Some(state);
        Ok(result)
    }

    async fn destroy_locked(&self, lock_id: &str) -> Result<ReconciliationResult> {
        let Some(state) = self.state_store.load().await? else {
            info!("No state found - nothing to destroy");
            return Ok(ReconciliationResult {
                success: true,
                ..ReconciliationResult::default()
            });
        };

        let diff = self.diff_engine.compute_destroy(&state);
        info!("Destroying {} resources", diff.deletes);

        let state = Mutex::new(state);
        let mut result = self.execute(&diff, &state, lock_id, Operation::Destroy).await;

        let mut state = state.into_inner();
        if result.success {
            state.config_hash.clear();
        }
        let config_hash = state.config_hash.clone();
        state.add_history(history_entry(Operation::Destroy, &config_hash, &diff, &result));
        self.state_store.save(&state).await?;

        result.final_state = Some(state);
        Ok(result)
    }

    /// Executes a diff in order, stopping at the first failed resource or
    /// as soon as the lock cannot be refreshed.
    async fn execute(
        &self,
        diff: &DiffResult,
        state: &Mutex<ReconcileState>,
        lock_id: &str,
        operation: Operation,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult {
            unchanged: diff.unchanged,
            ..ReconciliationResult::default()
        };

        for resource in diff.actionable_diffs() {
            if let Err(e) = self.state_store.refresh_lock(lock_id).await {
                error!("Stopping {operation}: {e}");
                result.errors.push(format!("{}: {e}", resource.key));
                break;
            }

            info!("{operation}: {resource}");
            match self.execute_one(resource, state).await {
                Ok(summary) => {
                    match resource.diff_type {
                        DiffType::Create => result.created += 1,
                        DiffType::Update => result.updated += 1,
                        DiffType::Replace => result.replaced += 1,
                        DiffType::Delete => result.deleted += 1,
                        DiffType::NoChange => {}
                    }
                    result.resources.extend(summary);
                }
                Err(e) => {
                    error!("{} failed: {e}", resource.key);
                    result.errors.push(format!("{}: {e}", resource.key));
                    break;
                }
            }
        }

        result.success = result.errors.is_empty();
        result
    }

    async fn execute_one(
        &self,
        diff: &ResourceDiff,
        state: &Mutex<ReconcileState>,
    ) -> Result<Option<ResourceSummary>> {
        match diff.diff_type {
            DiffType::NoChange => Ok(None),
            DiffType::Create => self.create(diff, state).await.map(Some),
            DiffType::Update => self.update(diff, state).await.map(Some),
            DiffType::Replace => {
                self.delete(diff, state).await?;
                self.create(diff, state).await.map(Some)
            }
            DiffType::Delete => {
                self.delete(diff, state).await?;
                Ok(None)
            }
        }
    }

    async fn create(&self, diff: &ResourceDiff, state: &Mutex<ReconcileState>) -> Result<ResourceSummary> {
        let desired = required(diff.desired.as_ref(), diff, "desired configuration")?;
        let hash = required(diff.new_hash.as_ref(), diff, "configuration hash")?;

        let recorder = AllocationWriter {
            store: self.state_store,
            state,
            key: &diff.key,
            config: desired,
            hash,
        };
        let summary = self.drivers.create(desired, &recorder).await?;
        info!("Created {} {} '{}'", summary.kind, summary.id, summary.name);

        let mut state = state.lock().await;
        state.set(
            ResourceRecord::new(&diff.key, summary.id, desired.clone(), hash)
                .with_instance(&summary.name),
        );
        self.state_store.save(&state).await?;
        Ok(summary)
    }

    async fn update(&self, diff: &ResourceDiff, state: &Mutex<ReconcileState>) -> Result<ResourceSummary> {
        let desired = required(diff.desired.as_ref(), diff, "desired configuration")?;
        let previous = required(diff.previous.as_ref(), diff, "applied configuration")?;
        let hash = required(diff.new_hash.as_ref(), diff, "configuration hash")?;
        let id = required(diff.id.as_ref(), diff, "remote ID")?;

        let mut applied = state
            .lock()
            .await
            .get(&diff.key)
            .map(|record| record.applied_toward(hash))
            .unwrap_or_default();
        if !applied.is_empty() {
            info!(
                "{}: resuming, {} steps already applied",
                diff.key,
                applied.len()
            );
        }

        let recorder = StateRecorder {
            store: self.state_store,
            state,
            key: &diff.key,
            target_hash: hash,
        };
        let summary = self
            .drivers
            .update(*id, previous, desired, &mut applied, &recorder)
            .await?;

        let mut state = state.lock().await;
        if let Some(record) = state.get_mut(&diff.key) {
            record.commit(desired.clone(), hash);
            record.instance.clone_from(&summary.name);
        }
        self.state_store.save(&state).await?;
        Ok(summary)
    }

    async fn delete(&self, diff: &ResourceDiff, state: &Mutex<ReconcileState>) -> Result<()> {
        let previous = required(diff.previous.as_ref(), diff, "applied configuration")?;
        let id = required(diff.id.as_ref(), diff, "remote ID")?;

        if self.drivers.delete(*id, previous).await? {
            info!("Deleted {} {id}", diff.kind);
        } else {
            info!("{} {id} was already gone", diff.kind);
        }

        let mut state = state.lock().await;
        state.remove(&diff.key);
        self.state_store.save(&state).await
    }
}

/// Unwraps a part of a diff the diff type guarantees.
fn required<'d, T>(value: Option<&'d T>, diff: &ResourceDiff, what: &str) -> Result<&'d T> {
    value.ok_or_else(|| {
        NebulaError::internal(format!("{} diff for {} has no {what}", diff.diff_type, diff.key))
    })
}

fn history_entry(
    operation: Operation,
    config_hash: &str,
    diff: &DiffResult,
    result: &ReconciliationResult,
) -> HistoryEntry {
    let resources = diff
        .actionable_diffs()
        .iter()
        .map(|d| d.key.clone())
        .collect();
    if result.success {
        HistoryEntry::new(operation, config_hash, resources)
    } else {
        HistoryEntry::failed(operation, config_hash, resources, &result.errors.join("; "))
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}
