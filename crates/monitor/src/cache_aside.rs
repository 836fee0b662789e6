use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::debug;

use crate::{store::CacheStore, Error, Result};

/// Read-through access for values no synchronizer keeps fresh.
///
/// Misses for the same key are serialized behind a per-key lock and the
/// cache is re-checked after acquiring it, so concurrent callers share a
/// single upstream fetch per TTL window.
pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key`, calling `fetch` on a miss and
    /// storing its result with the TTL. Fetch errors are returned as-is and
    /// nothing is stored.
    pub async fn get_and_store<F, Fut>(&self, key: &str, fetch: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.store.get(key).await? {
            return Ok(hit);
        }

        let lock = self.key_lock(key)?;
        let result = {
            let _guard = lock.lock().await;
            self.fill(key, fetch).await
        };
        drop(lock);
        self.release_lock(key)?;
        result
    }

    async fn fill<F, Fut>(&self, key: &str, fetch: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        // another caller may have filled it while we waited
        if let Some(hit) = self.store.get(key).await? {
            return Ok(hit);
        }

        debug!(key, "Cache miss, fetching");
        let value = fetch().await?;
        self.store.set(key, &value, Some(self.ttl)).await?;
        Ok(value)
    }

    fn key_lock(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| Error::Internal(format!("Cache lock table poisoned: {}", e)))?;
        Ok(locks.entry(key.to_string()).or_default().clone())
    }

    fn release_lock(&self, key: &str) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| Error::Internal(format!("Cache lock table poisoned: {}", e)))?;
        // only the table's own handle left
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}
