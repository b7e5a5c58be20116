use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CacheBackend, CacheError};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    /// Insertion order for eviction once `max_entries` is reached.
    order: VecDeque<String>,
}

/// In-process map with per-entry expiry. Expired entries are dropped on read and by
/// the periodic sweeper.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<Entries>,
    max_entries: Option<usize>,
}

impl MemoryCache {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: RwLock::default(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.map.len();
        entries.map.retain(|_, entry| !entry.is_expired(now));
        let Entries { map, order } = &mut *entries;
        order.retain(|key| map.contains_key(key));
        before - map.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired memory cache entries");
                        }
                    }
                }
            }
        })
    }

    fn get_now(&self, key: &str, now: Instant) -> Option<Bytes> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.map.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.map.remove(key);
            entries.order.retain(|candidate| candidate != key);
        }
        None
    }

    pub(crate) fn insert(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.map.insert(key.to_string(), entry).is_none() {
            entries.order.push_back(key.to_string());
        }
        if let Some(max_entries) = self.max_entries {
            while entries.map.len() > max_entries {
                let Some(oldest) = entries.order.pop_front() else {
                    break;
                };
                entries.map.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.get_now(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.map.remove(key).is_some() {
            entries.order.retain(|candidate| candidate != key);
        }
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .map
                    .get(key)
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.value.clone())
            })
            .collect())
    }
}
