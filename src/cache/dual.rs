use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{CacheBackend, CacheError, MemoryCache};

/// Lifetime of values copied into memory from the remote tier.
pub const BACKFILL_TTL: Duration = Duration::from_secs(300);

/// Memory in front of a shared remote tier.
#[derive(Debug)]
pub struct DualCache {
    memory: Arc<MemoryCache>,
    remote: Arc<dyn CacheBackend>,
}

impl DualCache {
    pub fn new(memory: Arc<MemoryCache>, remote: Arc<dyn CacheBackend>) -> Self {
        Self { memory, remote }
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    fn backfill_ttl(ttl: Option<Duration>) -> Duration {
        ttl.map_or(BACKFILL_TTL, |ttl| ttl.min(BACKFILL_TTL))
    }
}

#[async_trait]
impl CacheBackend for DualCache {
    fn name(&self) -> &'static str {
        "dual"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        if let Some(value) = self.memory.get(key).await? {
            return Ok(Some(value));
        }
        let value = self.remote.get(key).await?;
        if let Some(value) = value.as_ref() {
            self.memory.insert(key, value.clone(), Some(BACKFILL_TTL));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.memory
            .insert(key, value.clone(), Some(Self::backfill_ttl(ttl)));
        self.remote.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.memory.delete(key).await?;
        self.remote.delete(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, CacheError> {
        let mut out = self.memory.mget(keys).await?;
        let missing: Vec<usize> = out
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.is_none().then_some(idx))
            .collect();
        if missing.is_empty() {
            return Ok(out);
        }
        let missing_keys: Vec<String> = missing.iter().map(|idx| keys[*idx].clone()).collect();
        let remote = self.remote.mget(&missing_keys).await?;
        for (idx, value) in missing.into_iter().zip(remote) {
            if let Some(value) = value {
                self.memory.insert(&keys[idx], value.clone(), Some(BACKFILL_TTL));
                out[idx] = Some(value);
            }
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.remote.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory-backed remote tier that counts reads.
    #[derive(Debug, Default)]
    struct CountingRemote {
        inner: MemoryCache,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for CountingRemote {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn remote_hits_backfill_memory() {
        let remote = Arc::new(CountingRemote::default());
        remote.inner.insert("k", Bytes::from_static(b"v"), None);
        let cache = DualCache::new(Arc::new(MemoryCache::default()), remote.clone());

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(
            cache.memory().get("k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(remote.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mget_fills_only_memory_misses_from_remote() {
        let remote = Arc::new(CountingRemote::default());
        remote.inner.insert("b", Bytes::from_static(b"2"), None);
        let memory = Arc::new(MemoryCache::default());
        memory.insert("a", Bytes::from_static(b"1"), None);
        let cache = DualCache::new(memory.clone(), remote.clone());

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = cache.mget(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some(Bytes::from_static(b"1")), Some(Bytes::from_static(b"2")), None]
        );
        // default mget reads each missing key once
        assert_eq!(remote.reads.load(Ordering::SeqCst), 2);
        assert!(memory.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn writes_and_deletes_reach_both_tiers() {
        let remote = Arc::new(CountingRemote::default());
        let cache = DualCache::new(Arc::new(MemoryCache::default()), remote.clone());
        cache.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(remote.inner.get("k").await.unwrap().is_some());
        assert!(cache.memory().get("k").await.unwrap().is_some());
        cache.delete("k").await.unwrap();
        assert!(remote.inner.get("k").await.unwrap().is_none());
        assert!(cache.memory().get("k").await.unwrap().is_none());
    }
}
