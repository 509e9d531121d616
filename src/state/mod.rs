//! Applied-state storage.
//!
//! This module records which remote object backs each configured resource,
//! the configuration last applied to it, and the commit markers of updates
//! that stopped partway.

mod store;
mod local;
mod lock;
mod types;

pub use store::StateStore;
#[cfg(test)]
pub use store::MockStateStore;
pub use local::LocalStateStore;
pub use lock::{LockInfo, LOCK_EXPIRY_SECS, generate_holder_id};
pub use types::{HistoryEntry, Operation, PendingUpdate, ReconcileState, ResourceRecord, STATE_VERSION};
