//! In-process storage driver.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::storage::driver::StorageDriver;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Concurrent in-memory map with per-key TTL. Expired keys are removed
/// lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included until next access.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageDriver for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn get(&self, _ctx: &CallContext, key: &str) -> Result<Option<Bytes>, TransportError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(
        &self,
        _ctx: &CallContext,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, _ctx: &CallContext, key: &str) -> Result<(), TransportError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self, _ctx: &CallContext) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_get_expire() {
        let store = MemoryStore::new();
        let ctx = CallContext::background();
        store
            .set(&ctx, "session:1", Bytes::from("alice"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        store.set(&ctx, "forever", Bytes::from("x"), None).await.unwrap();

        assert_eq!(store.get(&ctx, "session:1").await.unwrap(), Some(Bytes::from("alice")));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get(&ctx, "session:1").await.unwrap(), None);
        assert_eq!(store.len(), 1);
        assert!(store.get(&ctx, "forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let store = MemoryStore::new();
        let ctx = CallContext::background();
        store.delete(&ctx, "nope").await.unwrap();
        store.set(&ctx, "k", Bytes::from("v"), None).await.unwrap();
        store.delete(&ctx, "k").await.unwrap();
        assert!(store.is_empty());
    }
}
