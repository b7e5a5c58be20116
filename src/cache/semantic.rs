//! Similarity cache: keys are prompt texts, looked up by embedding distance.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;

use super::{CacheBackend, CacheError};
use crate::router::auto_router::{Embedder, cosine};

pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.1;

const SCOPE_SEPARATOR: char = '\u{1f}';

/// Semantic cache key: entries only match others with the same `scope`.
pub fn scoped_key(scope: &str, text: &str) -> String {
    format!("{scope}{SCOPE_SEPARATOR}{text}")
}

/// `(scope, text)`; keys without a scope land in the empty scope.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once(SCOPE_SEPARATOR).unwrap_or(("", key))
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorHit {
    /// Cosine distance, `1 - cosine similarity`.
    pub distance: f64,
    pub value: Bytes,
}

#[async_trait]
pub trait VectorIndex: Send + Sync + fmt::Debug {
    /// Creates the index for `dim`-wide vectors if it does not exist yet.
    async fn ensure(&self, dim: usize) -> Result<(), CacheError>;

    /// Nearest stored vector within `scope`.
    async fn search(&self, scope: &str, vector: &[f32]) -> Result<Option<VectorHit>, CacheError>;

    async fn insert(
        &self,
        scope: &str,
        vector: Vec<f32>,
        text: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn remove(&self, scope: &str, text: &str) -> Result<(), CacheError>;
}

#[derive(Debug)]
struct IndexedEntry {
    scope: String,
    vector: Vec<f32>,
    text: String,
    value: Bytes,
    expires_at: Option<Instant>,
}

/// Brute-force index for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    entries: Mutex<Vec<IndexedEntry>>,
}

impl InMemoryVectorIndex {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure(&self, _dim: usize) -> Result<(), CacheError> {
        Ok(())
    }

    async fn search(&self, scope: &str, vector: &[f32]) -> Result<Option<VectorHit>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|entry| entry.expires_at.is_none_or(|expires_at| now < expires_at));
        Ok(entries
            .iter()
            .filter(|entry| entry.scope == scope)
            .map(|entry| VectorHit {
                distance: 1.0 - cosine(vector, &entry.vector),
                value: entry.value.clone(),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance)))
    }

    async fn insert(
        &self,
        scope: &str,
        vector: Vec<f32>,
        text: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|entry| entry.scope != scope || entry.text != text);
        entries.push(IndexedEntry {
            scope: scope.to_string(),
            vector,
            text: text.to_string(),
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        });
        Ok(())
    }

    async fn remove(&self, scope: &str, text: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|entry| entry.scope != scope || entry.text != text);
        Ok(())
    }
}

#[cfg(feature = "cache-redis")]
pub use redis_index::RedisVectorIndex;

#[cfg(feature = "cache-redis")]
mod redis_index {
    use super::*;
    use crate::cache::RedisCache;
    use crate::utils::hex_encode;
    use sha2::{Digest, Sha256};

    /// Redis Stack (RediSearch) HNSW index over hashes of `{scope, text, value, embedding}`.
    #[derive(Debug)]
    pub struct RedisVectorIndex {
        redis: Arc<RedisCache>,
        index_name: String,
        prefix: String,
    }

    impl RedisVectorIndex {
        pub fn new(redis: Arc<RedisCache>, index_name: impl Into<String>) -> Self {
            let index_name = index_name.into();
            let prefix = redis.key(&format!("{index_name}:"));
            Self {
                redis,
                index_name,
                prefix,
            }
        }

        fn entry_key(&self, scope: &str, text: &str) -> String {
            let digest = Sha256::new()
                .chain_update(scope.as_bytes())
                .chain_update([0u8])
                .chain_update(text.as_bytes())
                .finalize();
            format!("{}{}", self.prefix, hex_encode(&digest))
        }
    }

    /// KNN query restricted to one scope. Scopes are hex digests or empty.
    fn knn_query(scope: &str) -> String {
        let filter = if scope.is_empty() {
            "*".to_string()
        } else {
            format!("(@scope:{{{scope}}})")
        };
        format!("{filter}=>[KNN 1 @embedding $vec AS distance]")
    }

    fn vector_bytes(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    fn value_bytes(value: &redis::Value) -> Option<Vec<u8>> {
        match value {
            redis::Value::BulkString(bytes) => Some(bytes.clone()),
            redis::Value::SimpleString(text) => Some(text.clone().into_bytes()),
            _ => None,
        }
    }

    /// First document of an `FT.SEARCH ... RETURN 2 value distance` reply.
    fn parse_search_reply(reply: &redis::Value) -> Option<VectorHit> {
        let redis::Value::Array(items) = reply else {
            return None;
        };
        let redis::Value::Array(fields) = items.get(2)? else {
            return None;
        };
        let mut value = None;
        let mut distance = None;
        for pair in fields.chunks(2) {
            let [name, field] = pair else {
                continue;
            };
            match value_bytes(name).as_deref() {
                Some(b"value") => value = value_bytes(field),
                Some(b"distance") => {
                    distance = value_bytes(field)
                        .and_then(|raw| String::from_utf8(raw).ok())
                        .and_then(|raw| raw.parse::<f64>().ok());
                }
                _ => {}
            }
        }
        Some(VectorHit {
            distance: distance?,
            value: Bytes::from(value?),
        })
    }

    #[async_trait]
    impl VectorIndex for RedisVectorIndex {
        async fn ensure(&self, dim: usize) -> Result<(), CacheError> {
            let mut cmd = redis::cmd("FT.CREATE");
            cmd.arg(&self.index_name)
                .arg("ON")
                .arg("HASH")
                .arg("PREFIX")
                .arg(1)
                .arg(&self.prefix)
                .arg("SCHEMA")
                .arg("scope")
                .arg("TAG")
                .arg("text")
                .arg("TEXT")
                .arg("embedding")
                .arg("VECTOR")
                .arg("HNSW")
                .arg(6)
                .arg("TYPE")
                .arg("FLOAT32")
                .arg("DIM")
                .arg(dim)
                .arg("DISTANCE_METRIC")
                .arg("COSINE");
            match self.redis.query::<()>(&cmd).await {
                Ok(()) => Ok(()),
                Err(CacheError::Redis(err)) if err.to_string().contains("Index already exists") => Ok(()),
                Err(err) => Err(err),
            }
        }

        async fn search(&self, scope: &str, vector: &[f32]) -> Result<Option<VectorHit>, CacheError> {
            let mut cmd = redis::cmd("FT.SEARCH");
            cmd.arg(&self.index_name)
                .arg(knn_query(scope))
                .arg("PARAMS")
                .arg(2)
                .arg("vec")
                .arg(vector_bytes(vector))
                .arg("SORTBY")
                .arg("distance")
                .arg("RETURN")
                .arg(2)
                .arg("value")
                .arg("distance")
                .arg("DIALECT")
                .arg(2);
            let reply: redis::Value = self.redis.query(&cmd).await?;
            Ok(parse_search_reply(&reply))
        }

        async fn insert(
            &self,
            scope: &str,
            vector: Vec<f32>,
            text: &str,
            value: Bytes,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            let key = self.entry_key(scope, text);
            let mut cmd = redis::cmd("HSET");
            cmd.arg(&key)
                .arg("scope")
                .arg(scope)
                .arg("text")
                .arg(text)
                .arg("value")
                .arg(value.as_ref())
                .arg("embedding")
                .arg(vector_bytes(&vector));
            let _: i64 = self.redis.query(&cmd).await?;
            if let Some(ttl) = ttl {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let _: i64 = self
                    .redis
                    .query(redis::cmd("PEXPIRE").arg(&key).arg(millis))
                    .await?;
            }
            Ok(())
        }

        async fn remove(&self, scope: &str, text: &str) -> Result<(), CacheError> {
            let _: i64 = self
                .redis
                .query(redis::cmd("DEL").arg(self.entry_key(scope, text)))
                .await?;
            Ok(())
        }
    }

}

/// [`CacheBackend`] whose keys are prompt texts. A lookup embeds the text and returns
/// the nearest stored value within the distance threshold.
pub struct SemanticCache {
    embedder: Arc<dyn Embedder>,
    embedding_model: String,
    index: Arc<dyn VectorIndex>,
    distance_threshold: f64,
    initialized: OnceCell<()>,
}

impl fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticCache")
            .field("embedding_model", &self.embedding_model)
            .field("index", &self.index)
            .field("distance_threshold", &self.distance_threshold)
            .finish_non_exhaustive()
    }
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        embedding_model: impl Into<String>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            embedder,
            embedding_model: embedding_model.into(),
            index,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            initialized: OnceCell::new(),
        }
    }

    pub fn with_distance_threshold(mut self, threshold: f64) -> Self {
        self.distance_threshold = threshold;
        self
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CacheError> {
        let vectors = self
            .embedder
            .embed(&self.embedding_model, &[text.to_string()])
            .await?;
        Ok(vectors.into_iter().next().unwrap_or_default())
    }
}

#[async_trait]
impl CacheBackend for SemanticCache {
    fn name(&self) -> &'static str {
        "redis-semantic"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let (scope, text) = split_key(key);
        if text.trim().is_empty() {
            return Ok(None);
        }
        let vector = self.embed(text).await?;
        match self.index.search(scope, &vector).await? {
            Some(hit) if hit.distance < self.distance_threshold => {
                tracing::debug!(distance = hit.distance, "semantic cache hit");
                Ok(Some(hit.value))
            }
            Some(hit) => {
                tracing::debug!(distance = hit.distance, "semantic cache miss above threshold");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let (scope, text) = split_key(key);
        if text.trim().is_empty() {
            return Ok(());
        }
        let vector = self.embed(text).await?;
        let dim = vector.len();
        self.initialized
            .get_or_try_init(|| self.index.ensure(dim))
            .await?;
        self.index.insert(scope, vector, text, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let (scope, text) = split_key(key);
        self.index.remove(scope, text).await
    }
}
