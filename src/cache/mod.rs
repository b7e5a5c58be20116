//! Response caching: pluggable byte-oriented backends behind one trait, layered
//! composition, and the request fingerprint used as the key.

pub mod disk;
pub mod dual;
pub mod key;
pub mod memory;
pub mod object_store;
#[cfg(feature = "cache-redis")]
pub mod redis_cache;
pub mod semantic;
pub mod settings;
pub mod single_flight;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::auth::AuthError;
use crate::error::ProviderError;

pub use disk::DiskCache;
pub use dual::DualCache;
pub use key::{chat_cache_key, embedding_cache_key, prompt_text, semantic_scope};
pub use memory::MemoryCache;
pub use object_store::{HttpObjectStore, InMemoryObjectStore, ObjectStore, ObjectStoreCache, StoreDialect};
#[cfg(feature = "cache-redis")]
pub use redis_cache::{RedisCache, RedisSettings, RedisTopology};
pub use semantic::{InMemoryVectorIndex, SemanticCache, VectorHit, VectorIndex, scoped_key};
pub use settings::{CacheLayer, CacheParams, CacheType};
pub use single_flight::SingleFlight;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "cache-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object store returned {status}: {body}")]
    ObjectStore { status: u16, body: String },
    #[error("object store auth failed: {0}")]
    Auth(#[from] AuthError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error("failed to encode cache entry: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache misconfigured: {0}")]
    Config(String),
}

/// Byte store with per-entry expiry. `ttl = None` never expires.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// One slot per key, in order. Partial misses are `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Seconds from config into a TTL. Zero means no expiry; negative values are rejected.
pub fn ttl_from_seconds(seconds: f64) -> Result<Option<Duration>, CacheError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CacheError::InvalidTtl(format!("{seconds}")));
    }
    if seconds == 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

/// Per-request cache controls from the `cache` request field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub ttl: Option<Duration>,
}

impl CacheControl {
    pub fn from_extra(extra: &Map<String, Value>) -> Self {
        let Some(cache) = extra.get("cache").and_then(Value::as_object) else {
            return Self::default();
        };
        let flag = |name: &str| cache.get(name).and_then(Value::as_bool).unwrap_or(false);
        Self {
            no_cache: flag("no-cache"),
            no_store: flag("no-store"),
            ttl: cache
                .get("ttl")
                .and_then(Value::as_f64)
                .and_then(|ttl| ttl_from_seconds(ttl).ok().flatten()),
        }
    }
}

/// Typed facade over a backend. Backend errors are logged and read as misses.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Option<Duration>,
    semantic: bool,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            default_ttl,
            semantic: false,
        }
    }

    /// Keys become the prompt text, scoped by a fingerprint of the rest of the request.
    pub fn semantic(mut self) -> Self {
        self.semantic = true;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn chat_key(&self, group: &str, request: &crate::types::ChatCompletionRequest) -> String {
        if self.semantic {
            scoped_key(&semantic_scope(group, request), &prompt_text(request))
        } else {
            chat_cache_key(group, request)
        }
    }

    pub fn embedding_key(&self, group: &str, request: &crate::types::EmbeddingRequest) -> Option<String> {
        (!self.semantic).then(|| embedding_cache_key(group, request))
    }

    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(backend = self.backend.name(), error = %err, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(backend = self.backend.name(), error = %err, "cache lookup failed");
                None
            }
        }
    }

    pub async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode cache entry");
                return;
            }
        };
        if let Err(err) = self.backend.set(key, bytes, ttl.or(self.default_ttl)).await {
            tracing::warn!(backend = self.backend.name(), error = %err, "cache store failed");
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ttl_zero_means_no_expiry_and_negative_is_rejected() {
        assert_eq!(ttl_from_seconds(0.0).unwrap(), None);
        assert_eq!(
            ttl_from_seconds(1.5).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert!(matches!(
            ttl_from_seconds(-1.0),
            Err(CacheError::InvalidTtl(_))
        ));
    }

    #[test]
    fn cache_control_reads_request_field() {
        let extra = json!({"cache": {"no-cache": true, "ttl": 30}});
        let control = CacheControl::from_extra(extra.as_object().unwrap());
        assert!(control.no_cache);
        assert!(!control.no_store);
        assert_eq!(control.ttl, Some(Duration::from_secs(30)));
        assert_eq!(CacheControl::from_extra(&Map::new()), CacheControl::default());
    }

    #[test]
    fn semantic_keys_are_scoped_per_group_and_params() {
        use crate::types::{ChatCompletionRequest, ChatMessage};

        let cache = ResponseCache::new(Arc::new(MemoryCache::default()), None).semantic();
        let request = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("What is TCP?")]);
        let gpt = cache.chat_key("gpt-4o", &request);
        let claude = cache.chat_key("claude", &request);
        assert_ne!(gpt, claude);
        assert!(gpt.ends_with("What is TCP?"));

        let mut warmer = request.clone();
        warmer.temperature = Some(1.5);
        assert_ne!(cache.chat_key("gpt-4o", &warmer), gpt);

        let reworded = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("Explain TCP")]);
        let (scope, _) = semantic::split_key(&gpt);
        let reworded_key = cache.chat_key("gpt-4o", &reworded);
        let (reworded_scope, text) = semantic::split_key(&reworded_key);
        assert_eq!(scope, reworded_scope);
        assert_eq!(text, "Explain TCP");
    }

    #[tokio::test]
    async fn facade_round_trips_typed_values() {
        let cache = ResponseCache::new(Arc::new(MemoryCache::default()), None);
        cache.store("k", &json!({"answer": 42}), None).await;
        let value: Value = cache.lookup("k").await.unwrap();
        assert_eq!(value["answer"], 42);
        assert!(cache.lookup::<Value>("missing").await.is_none());
    }
}
