//! State types for tracking applied configuration.
//!
//! One record per managed resource: the numeric ID the remote side assigned,
//! the configuration last applied to it, and the commit markers of an update
//! that has not finished yet.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResourceConfig;
use crate::drivers::ResourceKind;
use crate::planner::AppliedSteps;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete applied state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileState {
    /// State format version.
    pub version: String,
    /// Endpoint the resources live on.
    pub endpoint: String,
    /// Hash of the last fully applied configuration.
    pub config_hash: String,
    /// Managed resources keyed by `kind/name`.
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Applied state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// State key. Empty in records written before keys were stored.
    #[serde(default)]
    pub key: String,
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Numeric ID assigned by the remote side.
    pub id: i64,
    /// Declared name, empty for an unnamed VM.
    pub name: String,
    /// Name the remote side reported after creation.
    #[serde(default)]
    pub instance: String,
    /// The object was allocated but never settled.
    #[serde(default)]
    pub tainted: bool,
    /// Configuration last applied in full.
    pub config: ResourceConfig,
    /// Hash of `config`.
    pub config_hash: String,
    /// An update that stopped partway.
    #[serde(default)]
    pub pending: Option<PendingUpdate>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Commit markers for an update toward `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Hash of the configuration being applied.
    pub target_hash: String,
    /// Steps already applied for that configuration.
    pub applied: AppliedSteps,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: Operation,
    /// Configuration hash at the time.
    pub config_hash: String,
    /// Keys of the resources touched.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error message of a failed run.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge toward the configuration.
    Apply,
    /// Delete every managed resource.
    Destroy,
}

impl ReconcileState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            endpoint: endpoint.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ResourceRecord> {
        self.resources.get(key)
    }

    /// Gets a mutable record by key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ResourceRecord> {
        self.resources.get_mut(key)
    }

    /// Adds or replaces a record.
    pub fn set(&mut self, record: ResourceRecord) {
        self.resources.insert(record.key(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by key.
    pub fn remove(&mut self, key: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(key);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns the keys of records with an unfinished update.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, r)| r.pending.is_some())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(key: &str, id: i64, config: ResourceConfig, config_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            kind: config.kind(),
            id,
            name: config.name().to_string(),
            instance: String::new(),
            tainted: false,
            config,
            config_hash: config_hash.to_string(),
            pending: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a record for an object that was allocated but has not reached
    /// its ready state yet.
    #[must_use]
    pub fn allocated(key: &str, id: i64, config: ResourceConfig, config_hash: &str) -> Self {
        Self {
            tainted: true,
            ..Self::new(key, id, config, config_hash)
        }
    }

    /// Sets the name the remote side reported.
    #[must_use]
    pub fn with_instance(mut self, instance: &str) -> Self {
        self.instance = instance.to_string();
        self
    }

    /// Returns the state key, e.g. `vnet/private`.
    #[must_use]
    pub fn key(&self) -> String {
        if self.key.is_empty() {
            format!("{}/{}", self.kind.label(), self.name)
        } else {
            self.key.clone()
        }
    }

    /// Returns the name to fall back on when the ID no longer resolves:
    /// the declared name, or the reported one for an unnamed VM.
    #[must_use]
    pub fn lookup_name(&self) -> &str {
        if self.name.is_empty() {
            &self.instance
        } else {
            &self.name
        }
    }

    /// Returns the markers already applied toward `target_hash`.
    ///
    /// Markers recorded for a different target are stale and ignored.
    #[must_use]
    pub fn applied_toward(&self, target_hash: &str) -> AppliedSteps {
        self.pending
            .as_ref()
            .filter(|p| p.target_hash == target_hash)
            .map(|p| p.applied.clone())
            .unwrap_or_default()
    }

    /// Stores the markers of an update in progress.
    pub fn mark_pending(&mut self, target_hash: &str, applied: &AppliedSteps) {
        let started_at = self
            .pending
            .as_ref()
            .filter(|p| p.target_hash == target_hash)
            .map_or_else(Utc::now, |p| p.started_at);
        self.pending = Some(PendingUpdate {
            target_hash: target_hash.to_string(),
            applied: applied.clone(),
            started_at,
        });
        self.updated_at = Utc::now();
    }

    /// Records a fully applied configuration and clears the markers.
    pub fn commit(&mut self, config: ResourceConfig, config_hash: &str) {
        self.name = config.name().to_string();
        self.config = config;
        self.config_hash = config_hash.to_string();
        self.pending = None;
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: Operation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SecurityGroupConfig, VnetConfig};
    use crate::planner::UpdateStep;

    fn vnet(name: &str) -> ResourceConfig {
        ResourceConfig::Vnet(VnetConfig {
            name: name.to_string(),
            description: None,
            permissions: None,
            uid: None,
            gid: None,
            bridge: Some(String::from("br0")),
            ip_start: None,
            ip_size: None,
            hold_size: 0,
            reservation_vnet: None,
            reservation_size: None,
            security_groups: vec![],
        })
    }

    #[test]
    fn test_records_are_keyed_by_kind_and_name() {
        let mut state = ReconcileState::new("http://one:2633/RPC2");
        state.set(ResourceRecord::new("vnet/private", 3, vnet("private"), "h1"));

        let record = state.get("vnet/private").expect("record");
        assert_eq!(record.id, 3);
        assert!(state.remove("vnet/private").is_some());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_markers_only_apply_to_their_target() {
        let mut record = ResourceRecord::new("vnet/private", 3, vnet("private"), "h1");
        let applied = AppliedSteps::from([UpdateStep::Body, UpdateStep::Rename]);

        record.mark_pending("h2", &applied);

        assert_eq!(record.applied_toward("h2"), applied);
        assert!(record.applied_toward("h3").is_empty());
    }

    #[test]
    fn test_commit_clears_markers() {
        let mut record = ResourceRecord::new("vnet/private", 3, vnet("private"), "h1");
        record.mark_pending("h2", &AppliedSteps::from([UpdateStep::Body]));

        record.commit(vnet("public"), "h2");

        assert!(record.pending.is_none());
        assert_eq!(record.name, "public");
        assert_eq!(record.config_hash, "h2");
        assert_eq!(record.key(), "vnet/private");
    }

    #[test]
    fn test_unnamed_vm_falls_back_to_reported_name() {
        let vm: ResourceConfig =
            serde_yaml::from_str("kind: vm\ntemplate_id: 4\n").expect("parse failed");

        let record = ResourceRecord::allocated("vm/#0", 12, vm, "h1").with_instance("web-12");

        assert!(record.tainted);
        assert_eq!(record.key(), "vm/#0");
        assert_eq!(record.name, "");
        assert_eq!(record.lookup_name(), "web-12");
    }

    #[test]
    fn test_record_without_stored_key_uses_kind_and_name() {
        let mut value =
            serde_json::to_value(ResourceRecord::new("vnet/private", 3, vnet("private"), "h1"))
                .expect("serialize");
        if let Some(fields) = value.as_object_mut() {
            fields.remove("key");
            fields.remove("instance");
            fields.remove("tainted");
        }

        let record: ResourceRecord = serde_json::from_value(value).expect("deserialize");

        assert_eq!(record.key(), "vnet/private");
        assert_eq!(record.lookup_name(), "private");
        assert!(!record.tainted);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = ReconcileState::new("");
        for _ in 0..105 {
            state.add_history(HistoryEntry::new(Operation::Apply, "h", vec![]));
        }
        assert_eq!(state.history.len(), 100);
    }

    #[test]
    fn test_pending_keys() {
        let mut state = ReconcileState::new("");
        let group = ResourceConfig::SecurityGroup(SecurityGroupConfig {
            name: String::from("web"),
            description: None,
            permissions: None,
            uid: None,
            gid: None,
            rules: vec![],
            commit: true,
            commit_outdated_only: false,
        });
        let mut record = ResourceRecord::new("secgroup/web", 1, group, "h1");
        record.mark_pending("h2", &AppliedSteps::new());
        state.set(record);
        state.set(ResourceRecord::new("vnet/private", 2, vnet("private"), "h1"));

        assert_eq!(state.pending_keys(), vec!["secgroup/web"]);
    }
}
