//! Diff engine for comparing desired configuration with applied state.
//!
//! The engine is pure: the reconciler reads the remote objects first and
//! passes in what it found. Resources are diffed in declaration order;
//! records that are no longer configured follow, VMs first.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{ConfigHasher, DeployConfig, ResourceConfig};
use crate::drivers::{ResourceKind, ResourceSummary};
use crate::state::{ReconcileState, ResourceRecord};

/// Engine for computing diffs between desired and applied states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceDiff {
    /// State key, `kind/name`.
    pub key: String,
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Remote ID, when one is recorded.
    pub id: Option<i64>,
    /// Top-level fields that changed, or why the action is needed.
    pub details: Vec<String>,
    /// Hash of the applied configuration.
    pub old_hash: Option<String>,
    /// Hash of the desired configuration.
    pub new_hash: Option<String>,
    /// Desired configuration, absent for deletes.
    pub desired: Option<ResourceConfig>,
    /// Applied configuration, absent for creates.
    pub previous: Option<ResourceConfig>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Complete diff result.
#[derive(Debug, Default, serde::Serialize)]
pub struct DiffResult {
    /// All resource diffs, in execution order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between desired config and applied state.
    ///
    /// `observed` holds the remote objects found for recorded resources,
    /// keyed like the state. A recorded key missing from it has vanished.
    /// `requires_replacement` decides whether a changed configuration can be
    /// applied in place.
    pub fn compute_diff(
        &self,
        config: &DeployConfig,
        state: Option<&ReconcileState>,
        observed: &HashMap<String, ResourceSummary>,
        requires_replacement: impl Fn(&ResourceConfig, &ResourceConfig) -> bool,
    ) -> DiffResult {
        let mut diffs = Vec::new();
        let desired = config.keyed_resources();

        for (key, resource) in &desired {
            let record = state.and_then(|s| s.get(key));
            diffs.push(self.compute_resource_diff(
                key,
                resource,
                record,
                observed.get(key),
                &requires_replacement,
            ));
        }

        if let Some(state) = state {
            diffs.extend(deletions(state, |key| desired.iter().any(|(k, _)| k == key)));
        }

        DiffResult::from_diffs(diffs)
    }

    /// Computes the deletion of every recorded resource, VMs first.
    #[must_use]
    pub fn compute_destroy(&self, state: &ReconcileState) -> DiffResult {
        DiffResult::from_diffs(deletions(state, |_| false))
    }

    /// Computes the diff for a single configured resource.
    fn compute_resource_diff(
        &self,
        key: &str,
        resource: &ResourceConfig,
        record: Option<&ResourceRecord>,
        observed: Option<&ResourceSummary>,
        requires_replacement: &impl Fn(&ResourceConfig, &ResourceConfig) -> bool,
    ) -> ResourceDiff {
        let new_hash = self.hasher.hash_resource(resource);
        let mut diff = ResourceDiff {
            key: key.to_string(),
            kind: resource.kind(),
            diff_type: DiffType::NoChange,
            id: record.map(|r| r.id),
            details: Vec::new(),
            old_hash: record.map(|r| r.config_hash.clone()),
            new_hash: Some(new_hash.clone()),
            desired: Some(resource.clone()),
            previous: record.map(|r| r.config.clone()),
        };

        let Some(record) = record else {
            debug!("{key} needs to be created");
            diff.diff_type = DiffType::Create;
            return diff;
        };

        let Some(observed) = observed else {
            debug!("{key} is recorded as {} but no longer exists", record.id);
            diff.diff_type = DiffType::Create;
            diff.details.push(format!("missing (was {})", record.id));
            return diff;
        };

        if record.tainted {
            debug!("{key} ({}) never became ready", record.id);
            diff.diff_type = DiffType::Replace;
            diff.details.push(String::from("tainted"));
            return diff;
        }

        if observed.needs_replacement {
            debug!("{key} is flagged for replacement");
            diff.diff_type = DiffType::Replace;
            diff.details.push(observed.status.clone());
            return diff;
        }

        let changed = record.config_hash != new_hash;
        if !changed && record.pending.is_none() {
            debug!("{key} is up to date");
            return diff;
        }

        diff.details = changed_fields(&record.config, resource);
        if record.pending.is_some() {
            diff.details.push(String::from("resume"));
        }

        diff.diff_type = if changed && requires_replacement(&record.config, resource) {
            DiffType::Replace
        } else {
            DiffType::Update
        };
        debug!("{key} needs {} ({})", diff.diff_type, diff.details.join(", "));
        diff
    }
}

/// Builds delete diffs for the records `keep` rejects, in deletion order.
fn deletions(state: &ReconcileState, keep: impl Fn(&str) -> bool) -> Vec<ResourceDiff> {
    let mut orphans: Vec<&ResourceRecord> = state
        .resources
        .iter()
        .filter(|(key, _)| !keep(key.as_str()))
        .map(|(_, record)| record)
        .collect();
    orphans.sort_by_key(|r| (deletion_rank(r.kind), r.key()));

    orphans
        .into_iter()
        .map(|record| {
            debug!("{} is no longer configured", record.key());
            ResourceDiff {
                key: record.key(),
                kind: record.kind,
                diff_type: DiffType::Delete,
                id: Some(record.id),
                details: vec![String::from("not configured")],
                old_hash: Some(record.config_hash.clone()),
                new_hash: None,
                desired: None,
                previous: Some(record.config.clone()),
            }
        })
        .collect()
}

/// Returns the top-level fields that differ between two configurations.
fn changed_fields(old: &ResourceConfig, new: &ResourceConfig) -> Vec<String> {
    let (Ok(serde_json::Value::Object(old)), Ok(serde_json::Value::Object(new))) =
        (canonical(old), canonical(new))
    else {
        return Vec::new();
    };

    let mut fields: Vec<String> = new
        .iter()
        .filter(|(field, value)| old.get(*field) != Some(*value))
        .map(|(field, _)| field.clone())
        .chain(
            old.keys()
                .filter(|field| !new.contains_key(*field))
                .cloned(),
        )
        .collect();
    fields.sort();
    fields
}

/// Serializes a configuration with its order-insensitive lists sorted.
fn canonical(resource: &ResourceConfig) -> serde_json::Result<serde_json::Value> {
    match resource {
        ResourceConfig::SecurityGroup(group) => {
            let mut group = group.clone();
            group.rules.sort();
            serde_json::to_value(ResourceConfig::SecurityGroup(group))
        }
        other => serde_json::to_value(other),
    }
}

/// Order in which unconfigured resources are deleted.
const fn deletion_rank(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Vm => 0,
        ResourceKind::Image => 1,
        ResourceKind::Vnet => 2,
        ResourceKind::SecurityGroup => 3,
        ResourceKind::User | ResourceKind::Group => 4,
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details.join(", "))?;
        }
        Ok(())
    }
}
