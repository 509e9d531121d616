//! State store trait definition.

use async_trait::async_trait;

use crate::error::Result;
use super::types::ReconcileState;
use super::lock::LockInfo;

/// Trait for state storage backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<ReconcileState>>;

    /// Saves the applied state.
    async fn save(&self, state: &ReconcileState) -> Result<()>;

    /// Deletes the applied state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state.
    ///
    /// An empty `holder` is replaced with a generated identifier.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Pushes the expiry of a held lock back by a full period.
    ///
    /// # Errors
    ///
    /// Fails when `lock_id` is no longer the current lock, e.g. because it
    /// expired and another process took it over.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases a lock on the state. A lock with a different ID is left alone.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
