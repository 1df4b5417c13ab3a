//! Named locks that keep periodic jobs from overlapping across a cluster.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use sync_core::Store;

use crate::params::EngineParameters;

pub const ROUTE: &str = "ROUTE";
pub const PUSH: &str = "PUSH";
pub const PULL: &str = "PULL";
pub const PURGE_OUTGOING: &str = "PURGE_OUTGOING";
pub const SYNC_TRIGGERS: &str = "SYNC_TRIGGERS";

pub const LOCK_ACTIONS: [&str; 5] = [ROUTE, PUSH, PULL, PURGE_OUTGOING, SYNC_TRIGGERS];

/// Lock service backed by the store's lock table, or by an in-process set
/// when clustering is disabled.
pub struct ClusterService {
    store: Arc<dyn Store>,
    server_id: String,
    enabled: bool,
    lock_timeout: Duration,
    held: Mutex<HashSet<String>>,
}

impl ClusterService {
    pub fn new(store: Arc<dyn Store>, params: &EngineParameters) -> Self {
        let server_id = params
            .cluster_server_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            store,
            server_id,
            enabled: params.cluster_lock_enabled,
            lock_timeout: params.cluster_lock_timeout(),
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Make sure a lock row exists for every action.
    pub async fn init(&self) -> Result<()> {
        if self.enabled {
            for action in LOCK_ACTIONS {
                self.store.init_lock(action).await?;
            }
        }
        Ok(())
    }

    pub async fn lock(&self, action: &str) -> Result<bool> {
        if !self.enabled {
            return Ok(self.held.lock().await.insert(action.to_string()));
        }
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.lock_timeout)?;
        self.store
            .try_acquire_lock(action, &self.server_id, now, now - timeout)
            .await
    }

    pub async fn unlock(&self, action: &str) -> Result<()> {
        if !self.enabled {
            self.held.lock().await.remove(action);
            return Ok(());
        }
        if !self.store.release_lock(action, &self.server_id).await? {
            tracing::warn!(
                "Failed to release lock for action:{} server:{}",
                action,
                self.server_id
            );
        }
        Ok(())
    }

    /// Run `work` while holding `action`. Returns `None` without running it
    /// when another holder has the lock. The lock is released even when the
    /// work fails.
    pub async fn with_lock<F, T>(&self, action: &str, work: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.lock(action).await? {
            return Ok(None);
        }
        let result = work.await;
        let released = self.unlock(action).await;
        let value = result?;
        released?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MemoryStore;

    fn service(store: &MemoryStore, server_id: &str, enabled: bool) -> ClusterService {
        let params = EngineParameters {
            cluster_server_id: Some(server_id.to_string()),
            cluster_lock_enabled: enabled,
            ..EngineParameters::default()
        };
        ClusterService::new(Arc::new(store.clone()), &params)
    }

    #[tokio::test]
    async fn test_shared_lock_excludes_other_servers() {
        let store = MemoryStore::new();
        let a = service(&store, "server-a", true);
        let b = service(&store, "server-b", true);
        a.init().await.unwrap();

        assert!(a.lock(ROUTE).await.unwrap());
        assert!(!b.lock(ROUTE).await.unwrap());
        assert!(b.lock(PUSH).await.unwrap());

        a.unlock(ROUTE).await.unwrap();
        assert!(b.lock(ROUTE).await.unwrap());
        assert_eq!(store.lock_holder(ROUTE).await.as_deref(), Some("server-b"));
    }

    #[tokio::test]
    async fn test_in_process_lock_when_disabled() {
        let store = MemoryStore::new();
        let cluster = service(&store, "server-a", false);

        assert!(cluster.lock(PULL).await.unwrap());
        assert!(!cluster.lock(PULL).await.unwrap());
        cluster.unlock(PULL).await.unwrap();
        assert!(cluster.lock(PULL).await.unwrap());
        assert_eq!(store.lock_holder(PULL).await, None);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = MemoryStore::new();
        let cluster = service(&store, "server-a", true);

        let failed: Result<Option<()>> = cluster
            .with_lock(PURGE_OUTGOING, async { Err(anyhow::anyhow!("purge failed")) })
            .await;
        assert!(failed.is_err());
        assert_eq!(store.lock_holder(PURGE_OUTGOING).await, None);

        let ran = cluster.with_lock(PURGE_OUTGOING, async { Ok(3) }).await.unwrap();
        assert_eq!(ran, Some(3));
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let store = MemoryStore::new();
        let a = service(&store, "server-a", true);
        let b = service(&store, "server-b", true);
        assert!(a.lock(SYNC_TRIGGERS).await.unwrap());

        let ran = b.with_lock(SYNC_TRIGGERS, async { Ok(()) }).await.unwrap();
        assert!(ran.is_none());
        assert_eq!(store.lock_holder(SYNC_TRIGGERS).await.as_deref(), Some("server-a"));
    }
}
