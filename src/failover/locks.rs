//! Per-cluster single-writer guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per cluster.
///
/// Every state-changing failover action holds the guard of its cluster, so
/// two operations on the same cluster never interleave while operations on
/// different clusters run freely.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `cluster_id`.
    pub async fn lock(&self, cluster_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(cluster_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_cluster_is_exclusive() {
        let locks = ClusterLocks::new();
        let cluster = Uuid::new_v4();

        let _held = locks.lock(cluster).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(cluster)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_other_cluster_not_blocked() {
        let locks = ClusterLocks::new();

        let _held = locks.lock(Uuid::new_v4()).await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(Uuid::new_v4())).await;
        assert!(other.is_ok());
    }
}
