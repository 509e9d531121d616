//! Identity resolution.
//!
//! A reference is either a numeric ID or a name. IDs are taken as-is; names
//! are looked up with a linear scan of the visible pool.

use std::future::Future;

use tracing::debug;

use crate::drivers::ResourceKind;
use crate::error::{ReconcileError, Result};
use crate::one::PoolEntry;

/// Resolves a reference to a numeric ID.
///
/// An integer reference is returned without a remote call; its existence is
/// checked by whatever info call follows. Otherwise `read_pool` is invoked
/// once and the first entry whose name matches exactly wins.
///
/// # Errors
///
/// Returns [`ReconcileError::NotFound`] if no pool entry carries the name, or
/// the pool reader's error.
pub async fn resolve<F, Fut>(reference: &str, kind: ResourceKind, read_pool: F) -> Result<i64>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<PoolEntry>>>,
{
    if let Ok(id) = reference.trim().parse::<i64>() {
        return Ok(id);
    }

    let pool = read_pool().await?;
    debug!("Scanning {} {kind} entries for '{reference}'", pool.len());

    first_match(&pool, reference).ok_or_else(|| {
        ReconcileError::NotFound {
            kind,
            reference: reference.to_string(),
        }
        .into()
    })
}

/// Returns the ID of the first entry named `name`.
#[must_use]
pub fn first_match(pool: &[PoolEntry], name: &str) -> Option<i64> {
    pool.iter().find(|entry| entry.name == name).map(|entry| entry.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NebulaError;
    use std::cell::Cell;

    fn pool() -> Vec<PoolEntry> {
        vec![
            PoolEntry { id: 10, name: String::from("a") },
            PoolEntry { id: 11, name: String::from("b") },
            PoolEntry { id: 12, name: String::from("a") },
        ]
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let id = resolve("a", ResourceKind::Image, || async { Ok(pool()) })
            .await
            .expect("resolve failed");
        assert_eq!(id, 10);
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let result = resolve("c", ResourceKind::Vnet, || async { Ok(pool()) }).await;
        assert!(matches!(
            result,
            Err(NebulaError::Reconcile(ReconcileError::NotFound { kind: ResourceKind::Vnet, .. }))
        ));
    }

    #[tokio::test]
    async fn test_numeric_reference_skips_pool() {
        let scanned = Cell::new(false);
        let id = resolve("42", ResourceKind::Vm, || {
            scanned.set(true);
            async { Ok(Vec::new()) }
        })
        .await
        .expect("resolve failed");

        assert_eq!(id, 42);
        assert!(!scanned.get());
    }
}
