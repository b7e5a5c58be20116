//! `tianji_settings.cache_params`: which backend to build and how.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use super::{
    CacheError, DiskCache, DualCache, HttpObjectStore, InMemoryVectorIndex, MemoryCache,
    ObjectStoreCache, ResponseCache, SemanticCache, StoreDialect, VectorIndex, ttl_from_seconds,
};
use crate::auth::{CachedToken, GoogleAdcSource, SigV4Signer, StaticToken};
use crate::router::auto_router::Embedder;
use crate::utils::env::resolve_env_ref;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    #[default]
    #[serde(alias = "memory", alias = "in-memory")]
    Local,
    Redis,
    #[serde(alias = "redis_semantic")]
    RedisSemantic,
    S3,
    Gcs,
    #[serde(alias = "azure_blob", alias = "azure")]
    AzureBlob,
    Disk,
    #[serde(alias = "dual_cache")]
    Dual,
}

fn default_ttl() -> f64 {
    600.0
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

#[derive(Clone, Deserialize)]
pub struct CacheParams {
    #[serde(default, rename = "type")]
    pub kind: CacheType,
    /// Seconds; `0` stores without expiry.
    #[serde(default = "default_ttl")]
    pub ttl: f64,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub max_entries: Option<usize>,

    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default = "default_embedding_model", alias = "redis_semantic_cache_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub index_name: Option<String>,

    #[serde(default)]
    pub s3_bucket_name: Option<String>,
    #[serde(default)]
    pub s3_region_name: Option<String>,
    #[serde(default)]
    pub s3_endpoint_url: Option<String>,
    #[serde(default)]
    pub s3_aws_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_aws_session_token: Option<String>,

    #[serde(default)]
    pub gcs_bucket_name: Option<String>,
    #[serde(default)]
    pub gcs_path_service_account: Option<PathBuf>,
    #[serde(default)]
    pub gcs_access_token: Option<String>,
    #[serde(default)]
    pub gcs_endpoint_url: Option<String>,

    #[serde(default)]
    pub azure_container_url: Option<String>,
    #[serde(default)]
    pub azure_sas_token: Option<String>,

    #[serde(default)]
    pub disk_cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub cache_prefix: Option<String>,
}

impl fmt::Debug for CacheParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("CacheParams")
            .field("kind", &self.kind)
            .field("ttl", &self.ttl)
            .field("namespace", &self.namespace)
            .field("host", &self.host)
            .field("password", &redacted(&self.password))
            .field("similarity_threshold", &self.similarity_threshold)
            .field("embedding_model", &self.embedding_model)
            .field("s3_bucket_name", &self.s3_bucket_name)
            .field("s3_aws_secret_access_key", &redacted(&self.s3_aws_secret_access_key))
            .field("gcs_bucket_name", &self.gcs_bucket_name)
            .field("gcs_access_token", &redacted(&self.gcs_access_token))
            .field("azure_container_url", &self.azure_container_url)
            .field("azure_sas_token", &redacted(&self.azure_sas_token))
            .field("disk_cache_dir", &self.disk_cache_dir)
            .finish_non_exhaustive()
    }
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            kind: CacheType::default(),
            ttl: default_ttl(),
            namespace: None,
            max_entries: None,
            host: None,
            port: None,
            password: None,
            url: None,
            similarity_threshold: None,
            embedding_model: default_embedding_model(),
            index_name: None,
            s3_bucket_name: None,
            s3_region_name: None,
            s3_endpoint_url: None,
            s3_aws_access_key_id: None,
            s3_aws_secret_access_key: None,
            s3_aws_session_token: None,
            gcs_bucket_name: None,
            gcs_path_service_account: None,
            gcs_access_token: None,
            gcs_endpoint_url: None,
            azure_container_url: None,
            azure_sas_token: None,
            disk_cache_dir: None,
            cache_prefix: None,
        }
    }
}

/// A built cache plus the memory tier the sweeper should visit, if any.
#[derive(Clone, Debug)]
pub struct CacheLayer {
    pub cache: ResponseCache,
    pub memory: Option<Arc<MemoryCache>>,
}

fn resolved(value: &Option<String>) -> Option<String> {
    value.as_deref().and_then(resolve_env_ref)
}

fn required(value: &Option<String>, field: &str) -> Result<String, CacheError> {
    resolved(value).ok_or_else(|| CacheError::Config(format!("cache_params.{field} is required")))
}

impl CacheParams {
    /// Builds the configured backend. Semantic caching needs an embedder.
    pub fn build(
        &self,
        http: &reqwest::Client,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<CacheLayer, CacheError> {
        let ttl = ttl_from_seconds(self.ttl)?;
        let memory = || Arc::new(match self.max_entries {
            Some(max) => MemoryCache::with_max_entries(max),
            None => MemoryCache::default(),
        });
        let layer = match self.kind {
            CacheType::Local => {
                let memory = memory();
                CacheLayer {
                    cache: ResponseCache::new(memory.clone(), ttl),
                    memory: Some(memory),
                }
            }
            CacheType::Disk => {
                let dir = self
                    .disk_cache_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".tianji_cache"));
                CacheLayer {
                    cache: ResponseCache::new(Arc::new(DiskCache::new(dir)), ttl),
                    memory: None,
                }
            }
            CacheType::S3 | CacheType::Gcs | CacheType::AzureBlob => {
                let mut store = HttpObjectStore::new(http.clone(), self.object_store_dialect()?);
                let endpoint = match self.kind {
                    CacheType::S3 => resolved(&self.s3_endpoint_url),
                    CacheType::Gcs => resolved(&self.gcs_endpoint_url),
                    _ => None,
                };
                if let Some(endpoint) = endpoint {
                    store = store.with_endpoint(endpoint);
                }
                let mut backend = ObjectStoreCache::new(Arc::new(store));
                if let Some(prefix) = self.cache_prefix.as_deref() {
                    backend = backend.with_prefix(prefix);
                }
                CacheLayer {
                    cache: ResponseCache::new(Arc::new(backend), ttl),
                    memory: None,
                }
            }
            CacheType::Redis => CacheLayer {
                cache: ResponseCache::new(self.redis_backend()?, ttl),
                memory: None,
            },
            CacheType::Dual => {
                let memory = memory();
                let dual = DualCache::new(memory.clone(), self.redis_backend()?);
                CacheLayer {
                    cache: ResponseCache::new(Arc::new(dual), ttl),
                    memory: Some(memory),
                }
            }
            CacheType::RedisSemantic => {
                let embedder = embedder.ok_or_else(|| {
                    CacheError::Config("semantic cache requires an embedding model".to_string())
                })?;
                let mut semantic = SemanticCache::new(
                    embedder,
                    self.embedding_model.clone(),
                    self.vector_index()?,
                );
                if let Some(similarity) = self.similarity_threshold {
                    semantic = semantic.with_distance_threshold(1.0 - similarity);
                }
                CacheLayer {
                    cache: ResponseCache::new(Arc::new(semantic), ttl).semantic(),
                    memory: None,
                }
            }
        };
        tracing::info!(backend = layer.cache.backend().name(), ?ttl, "response cache enabled");
        Ok(layer)
    }

    fn object_store_dialect(&self) -> Result<StoreDialect, CacheError> {
        match self.kind {
            CacheType::S3 => {
                let bucket = required(&self.s3_bucket_name, "s3_bucket_name")?;
                let region = resolved(&self.s3_region_name);
                let signer = match (
                    resolved(&self.s3_aws_access_key_id),
                    resolved(&self.s3_aws_secret_access_key),
                ) {
                    (Some(access), Some(secret)) => SigV4Signer::new(
                        access,
                        secret,
                        resolved(&self.s3_aws_session_token),
                        region.unwrap_or_else(|| "us-east-1".to_string()),
                        "s3",
                    )?,
                    _ => SigV4Signer::from_env(region.as_deref(), "s3")?,
                };
                Ok(StoreDialect::S3 { bucket, signer })
            }
            CacheType::Gcs => {
                let bucket = required(&self.gcs_bucket_name, "gcs_bucket_name")?;
                let token = match resolved(&self.gcs_access_token) {
                    Some(token) => CachedToken::new(StaticToken(token)),
                    None => {
                        let mut source = GoogleAdcSource::default();
                        if let Some(path) = self.gcs_path_service_account.clone() {
                            source = source.with_credentials_file(path);
                        }
                        CachedToken::new(source)
                    }
                };
                Ok(StoreDialect::Gcs {
                    bucket,
                    token: Arc::new(token),
                })
            }
            CacheType::AzureBlob => Ok(StoreDialect::Azure {
                container_url: required(&self.azure_container_url, "azure_container_url")?,
                sas_token: resolved(&self.azure_sas_token),
            }),
            other => Err(CacheError::Config(format!("{other:?} is not an object store"))),
        }
    }

    #[cfg(feature = "cache-redis")]
    fn redis_cache(&self) -> Result<Arc<super::RedisCache>, CacheError> {
        use super::{RedisCache, RedisSettings};

        let mut settings = if let Some(url) = resolved(&self.url) {
            RedisSettings::standalone(url)
        } else if let Some(host) = resolved(&self.host) {
            let port = resolved(&self.port).unwrap_or_else(|| "6379".to_string());
            RedisSettings::standalone(format!("{host}:{port}"))
        } else {
            RedisSettings::from_env()?
        };
        if let Some(password) = resolved(&self.password) {
            settings.password = Some(password);
        }
        if let Some(namespace) = self.namespace.clone() {
            settings = settings.with_namespace(namespace);
        }
        Ok(Arc::new(RedisCache::new(settings)))
    }

    #[cfg(feature = "cache-redis")]
    fn redis_backend(&self) -> Result<Arc<dyn super::CacheBackend>, CacheError> {
        Ok(self.redis_cache()?)
    }

    #[cfg(not(feature = "cache-redis"))]
    fn redis_backend(&self) -> Result<Arc<dyn super::CacheBackend>, CacheError> {
        Err(CacheError::Config(
            "redis caching requires the cache-redis feature".to_string(),
        ))
    }

    #[cfg(feature = "cache-redis")]
    fn vector_index(&self) -> Result<Arc<dyn VectorIndex>, CacheError> {
        let configured = resolved(&self.url).is_some() || resolved(&self.host).is_some();
        let from_env = ["REDIS_URL", "REDIS_HOST", "REDIS_CLUSTER_NODES", "REDIS_SENTINEL_NODES"]
            .iter()
            .any(|name| crate::utils::env::env_var(name).is_some());
        if !configured && !from_env {
            tracing::warn!("no redis configured for the semantic cache, using a process-local index");
            return Ok(Arc::new(InMemoryVectorIndex::default()));
        }
        let index_name = self
            .index_name
            .clone()
            .unwrap_or_else(|| "tianji_semantic_cache".to_string());
        Ok(Arc::new(super::semantic::RedisVectorIndex::new(
            self.redis_cache()?,
            index_name,
        )))
    }

    #[cfg(not(feature = "cache-redis"))]
    fn vector_index(&self) -> Result<Arc<dyn VectorIndex>, CacheError> {
        Ok(Arc::new(InMemoryVectorIndex::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn params(yaml: &str) -> CacheParams {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_types_and_aliases() {
        assert_eq!(params("type: local").kind, CacheType::Local);
        assert_eq!(params("type: redis-semantic").kind, CacheType::RedisSemantic);
        assert_eq!(params("type: azure-blob").kind, CacheType::AzureBlob);
        assert_eq!(params("type: dual").kind, CacheType::Dual);
        assert_eq!(params("{}").ttl, 600.0);
    }

    #[test]
    fn builds_local_and_disk_backends() {
        let http = reqwest::Client::new();
        let layer = params("type: local\nttl: 0").build(&http, None).unwrap();
        assert_eq!(layer.cache.backend().name(), "local");
        assert!(layer.memory.is_some());

        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("type: disk\ndisk_cache_dir: {}", dir.path().display());
        let layer = params(&yaml).build(&http, None).unwrap();
        assert_eq!(layer.cache.backend().name(), "disk");
        assert!(layer.memory.is_none());
    }

    #[test]
    fn rejects_negative_ttl_and_missing_fields() {
        let http = reqwest::Client::new();
        assert!(matches!(
            params("type: local\nttl: -5").build(&http, None),
            Err(CacheError::InvalidTtl(_))
        ));
        assert!(matches!(
            params("type: azure-blob").build(&http, None),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            params("type: redis-semantic").build(&http, None),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn object_stores_build_from_explicit_credentials() {
        let http = reqwest::Client::new();
        let layer = params(
            "type: s3\ns3_bucket_name: b\ns3_region_name: eu-west-1\ns3_aws_access_key_id: AKID\ns3_aws_secret_access_key: SECRET",
        )
        .build(&http, None)
        .unwrap();
        assert_eq!(layer.cache.backend().name(), "s3");

        let layer = params("type: gcs\ngcs_bucket_name: b\ngcs_access_token: tok")
            .build(&http, None)
            .unwrap();
        assert_eq!(layer.cache.backend().name(), "gcs");
    }

    #[test]
    fn debug_redacts_secrets() {
        let params = params("type: azure-blob\nazure_sas_token: sig=secret\npassword: hunter2");
        let debug = format!("{params:?}");
        assert!(!debug.contains("sig=secret"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn semantic_without_redis_falls_back_to_local_index() {
        if crate::utils::env::env_var("REDIS_URL").is_some()
            || crate::utils::env::env_var("REDIS_HOST").is_some()
        {
            return;
        }
        let http = reqwest::Client::new();
        let layer = params("type: redis-semantic\nsimilarity_threshold: 0.9")
            .build(&http, Some(Arc::new(NullEmbedder)))
            .unwrap();
        assert_eq!(layer.cache.backend().name(), "redis-semantic");
        let request = crate::types::ChatCompletionRequest::new(
            "m",
            vec![crate::types::ChatMessage::user("hello")],
        );
        assert_eq!(layer.cache.chat_key("g", &request), "hello");
    }
}
