//! Time-bounded configuration cache.

use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Keyed cache whose entries expire after a fixed time-to-live.
///
/// The lock is held while a missing entry is loaded, so concurrent readers
/// that miss on the same cache wait for one load instead of each issuing
/// their own.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, Arc<V>)>>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, key: &K, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some((loaded_at, value)) = entries.get(key) {
            if loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(value));
            }
        }
        let value = Arc::new(load().await?);
        entries.insert(key.clone(), (Instant::now(), Arc::clone(&value)));
        Ok(value)
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }

    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn load(counter: &AtomicUsize) -> Result<usize> {
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: TtlCache<(), usize> = TtlCache::new(Duration::from_secs(600));
        let loads = AtomicUsize::new(0);

        assert_eq!(*cache.get_or_load(&(), || load(&loads)).await.unwrap(), 1);
        assert_eq!(*cache.get_or_load(&(), || load(&loads)).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(*cache.get_or_load(&(), || load(&loads)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache: TtlCache<String, usize> = TtlCache::new(Duration::from_secs(600));
        let loads = AtomicUsize::new(0);
        let key = "store-001".to_string();

        cache.get_or_load(&key, || load(&loads)).await.unwrap();
        cache.invalidate(&key).await;
        assert_eq!(*cache.get_or_load(&key, || load(&loads)).await.unwrap(), 2);

        cache.invalidate_all().await;
        assert_eq!(*cache.get_or_load(&key, || load(&loads)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache: TtlCache<(), usize> = TtlCache::new(Duration::from_secs(600));
        let result = cache
            .get_or_load(&(), || async { Err(anyhow::anyhow!("store down")) })
            .await;
        assert!(result.is_err());
        assert_eq!(*cache.get_or_load(&(), || async { Ok(7) }).await.unwrap(), 7);
    }
}
