//! Local file-based state storage backend.
//!
//! Both the state file and the lock file are rewritten through a temporary
//! file and a rename, so a crash mid-write leaves the previous copy intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{NebulaError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{ReconcileState, STATE_VERSION};

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

fn storage_error(action: &str, e: impl std::fmt::Display) -> NebulaError {
    NebulaError::State(StateError::Storage {
        message: format!("Failed to {action}: {e}"),
    })
}

fn corrupted(what: &str, e: impl std::fmt::Display) -> NebulaError {
    NebulaError::State(StateError::Corrupted {
        message: format!("Failed to read {what}: {e}"),
    })
}

fn lock_failed(message: String) -> NebulaError {
    NebulaError::State(StateError::LockFailed { message })
}

impl LocalStateStore {
    /// Creates a store keeping its files in `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Reads and parses a JSON file; `None` if it does not exist.
    async fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).await.map_err(|e| corrupted(what, e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| corrupted(what, e))
    }

    /// Serializes `value` next to `path`, syncs it, then renames it over `path`.
    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| storage_error("create state directory", e))?;
        }

        let content = serde_json::to_string_pretty(value).map_err(|e| {
            NebulaError::State(StateError::SerializationError {
                message: e.to_string(),
            })
        })?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_error("create temporary file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| storage_error("write temporary file", e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("sync temporary file", e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| storage_error(&format!("replace {}", path.display()), e))
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path, "lock file").await
    }

    async fn remove_lock(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| lock_failed(format!("Failed to delete lock file: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ReconcileState>> {
        let Some(state) =
            Self::read_json::<ReconcileState>(&self.state_path, "state file").await?
        else {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        };

        if state.version != STATE_VERSION {
            return Err(NebulaError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        debug!(
            "Loaded {} resource records from {}",
            state.resources.len(),
            self.state_path.display()
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &ReconcileState) -> Result<()> {
        self.write_json(&self.state_path, state).await?;
        debug!("Saved {} resource records", state.resources.len());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| storage_error("delete state file", e))?;
        }
        self.remove_lock().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(NebulaError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock = LockInfo::new(&holder);
        self.write_json(&self.lock_path, &lock).await?;

        info!("Acquired state lock {} (expires in {LOCK_EXPIRY_SECS}s)", lock.lock_id);
        Ok(lock)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock().await? {
            Some(mut lock) if lock.lock_id == lock_id => {
                lock.refresh();
                self.write_json(&self.lock_path, &lock).await?;
                debug!("Refreshed state lock {lock_id} ({}s left)", lock.remaining_secs());
                Ok(lock)
            }
            Some(other) => Err(NebulaError::State(StateError::LockedByOther {
                holder: other.holder,
                since: other.acquired_at.to_rfc3339(),
            })),
            None => Err(lock_failed(format!("Lock {lock_id} is no longer held"))),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.remove_lock().await?;
                info!("Released state lock {lock_id}");
            }
            Some(existing) => debug!(
                "Not releasing lock {}: it does not match {lock_id}",
                existing.lock_id
            ),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.read_lock().await?.is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceConfig, SecurityGroupConfig};
    use crate::planner::{AppliedSteps, UpdateStep};
    use crate::state::ResourceRecord;
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn group(name: &str) -> ResourceConfig {
        ResourceConfig::SecurityGroup(SecurityGroupConfig {
            name: name.to_string(),
            description: None,
            permissions: Some(String::from("640")),
            uid: None,
            gid: None,
            rules: vec![],
            commit: true,
            commit_outdated_only: false,
        })
    }

    #[tokio::test]
    async fn test_save_and_load_keeps_markers() {
        let (store, _temp) = create_test_store();

        let mut state = ReconcileState::new("http://one:2633/RPC2");
        let mut record = ResourceRecord::new("secgroup/web", 12, group("web"), "h1");
        record.mark_pending("h2", &AppliedSteps::from([UpdateStep::Body]));
        state.set(record);
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        let record = loaded.get("secgroup/web").expect("record");
        assert_eq!(record.id, 12);
        assert_eq!(record.applied_toward("h2"), AppliedSteps::from([UpdateStep::Body]));
        assert_eq!(loaded.endpoint, "http://one:2633/RPC2");
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = tokio_test::assert_ok!(store.load().await);
        assert!(result.is_none());
        assert!(!tokio_test::assert_ok!(store.exists().await));
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join(STATE_FILE), "{not json").expect("write");

        assert!(matches!(
            store.load().await,
            Err(NebulaError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_reported() {
        let (store, _temp) = create_test_store();
        let mut state = ReconcileState::new("");
        state.version = String::from("0.1");
        store.save(&state).await.expect("Failed to save state");

        assert!(matches!(
            store.load().await,
            Err(NebulaError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_lock() {
        let (store, _temp) = create_test_store();

        store.save(&ReconcileState::new("")).await.expect("Failed to save state");
        store.acquire_lock("ci").await.expect("Failed to acquire lock");
        assert!(store.exists().await.expect("exists check failed"));

        store.delete().await.expect("Failed to delete");
        assert!(!store.exists().await.expect("exists check failed"));
        assert!(!store.is_locked().await.expect("is_locked failed"));
        assert_eq!(store.backend_type(), "local");
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock("someone-else")
            .await
            .expect("Failed to release lock");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(NebulaError::State(StateError::LockedByOther { .. }))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_a_nearly_expired_lock_alive() {
        let (store, _temp) = create_test_store();
        let mut lock = store.acquire_lock("runner").await.expect("Failed to acquire lock");
        lock.expires_at = Utc::now() + chrono::Duration::seconds(5);
        store.write_json(&store.lock_path, &lock).await.expect("write lock");

        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh failed");

        assert_eq!(refreshed.lock_id, lock.lock_id);
        assert!(refreshed.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        let stored = store.get_lock_info().await.expect("read lock").expect("lock");
        assert_eq!(stored.expires_at, refreshed.expires_at);
    }

    #[tokio::test]
    async fn test_refresh_fails_once_the_lock_changed_hands() {
        let (store, _temp) = create_test_store();
        let mut lock = store.acquire_lock("runner").await.expect("Failed to acquire lock");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.write_json(&store.lock_path, &lock).await.expect("write lock");
        store.acquire_lock("other").await.expect("take over expired lock");

        let result = store.refresh_lock(&lock.lock_id).await;

        assert!(matches!(
            result,
            Err(NebulaError::State(StateError::LockedByOther { ref holder, .. })) if holder == "other"
        ));
    }

    #[tokio::test]
    async fn test_refresh_of_a_released_lock_fails() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("runner").await.expect("Failed to acquire lock");
        store.release_lock(&lock.lock_id).await.expect("release failed");

        assert!(matches!(
            store.refresh_lock(&lock.lock_id).await,
            Err(NebulaError::State(StateError::LockFailed { .. }))
        ));
    }
}
