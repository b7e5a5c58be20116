//! Object-store cache tier. Values are objects named by the key digest; expiry
//! rides along in object metadata and is enforced on read.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{CacheBackend, CacheError};
use crate::auth::{CachedToken, SigV4Signer, SigV4Timestamp};
use crate::utils::hex_encode;

const AZURE_API_VERSION: &str = "2023-11-03";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub expires_at_millis: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, CacheError>;

    async fn put_object(
        &self,
        name: &str,
        body: Bytes,
        expires_at_millis: Option<u64>,
    ) -> Result<(), CacheError>;

    /// Missing objects are not an error.
    async fn delete_object(&self, name: &str) -> Result<(), CacheError>;
}

/// Wire flavour and credentials of an [`HttpObjectStore`].
#[derive(Clone)]
pub enum StoreDialect {
    /// Virtual-hosted S3 URLs, or `{endpoint}/{bucket}/{name}` when an endpoint is set.
    S3 {
        bucket: String,
        signer: SigV4Signer,
    },
    /// GCS XML API with a bearer token.
    Gcs {
        bucket: String,
        token: Arc<CachedToken>,
    },
    /// Azure Blob with a container URL and optional SAS query string.
    Azure {
        container_url: String,
        sas_token: Option<String>,
    },
}

impl fmt::Debug for StoreDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 { bucket, signer } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("signer", signer)
                .finish(),
            Self::Gcs { bucket, .. } => f.debug_struct("Gcs").field("bucket", bucket).finish_non_exhaustive(),
            Self::Azure { container_url, sas_token } => f
                .debug_struct("Azure")
                .field("container_url", container_url)
                .field("sas_token", &sas_token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl StoreDialect {
    fn meta_header(&self) -> &'static str {
        match self {
            Self::S3 { .. } => "x-amz-meta-expires-at",
            Self::Gcs { .. } => "x-goog-meta-expires-at",
            Self::Azure { .. } => "x-ms-meta-expiresat",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpObjectStore {
    http: reqwest::Client,
    dialect: StoreDialect,
    endpoint: Option<String>,
}

impl HttpObjectStore {
    pub fn new(http: reqwest::Client, dialect: StoreDialect) -> Self {
        Self {
            http,
            dialect,
            endpoint: None,
        }
    }

    /// Overrides the S3 or GCS service root (MinIO, emulators).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn object_url(&self, name: &str) -> String {
        match &self.dialect {
            StoreDialect::S3 { bucket, signer } => match self.endpoint.as_deref() {
                Some(endpoint) => format!("{endpoint}/{bucket}/{name}"),
                None => format!("https://{bucket}.s3.{}.amazonaws.com/{name}", signer.region()),
            },
            StoreDialect::Gcs { bucket, .. } => {
                let endpoint = self
                    .endpoint
                    .as_deref()
                    .unwrap_or("https://storage.googleapis.com");
                format!("{endpoint}/{bucket}/{name}")
            }
            StoreDialect::Azure {
                container_url,
                sas_token,
            } => {
                let base = format!("{}/{name}", container_url.trim_end_matches('/'));
                match sas_token.as_deref().map(|sas| sas.trim_start_matches('?')) {
                    Some(sas) if !sas.is_empty() => format!("{base}?{sas}"),
                    _ => base,
                }
            }
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        name: &str,
        mut headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<reqwest::Response, CacheError> {
        let url = self.object_url(name);
        match &self.dialect {
            StoreDialect::S3 { signer, .. } => {
                let signed = signer.sign(
                    method.as_str(),
                    &url,
                    &headers,
                    &body,
                    SigV4Timestamp::now()?,
                )?;
                signed.headers.apply(&mut headers);
            }
            StoreDialect::Gcs { token, .. } => {
                let token = token.get(&self.http).await?;
                headers.insert("authorization".to_string(), token.authorization_header_value());
            }
            StoreDialect::Azure { .. } => {
                headers.insert("x-ms-version".to_string(), AZURE_API_VERSION.to_string());
            }
        }
        let mut request = self.http.request(method, &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request.body(body).send().await?)
    }
}

async fn status_error(response: reqwest::Response) -> CacheError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    CacheError::ObjectStore { status, body }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &'static str {
        match self.dialect {
            StoreDialect::S3 { .. } => "s3",
            StoreDialect::Gcs { .. } => "gcs",
            StoreDialect::Azure { .. } => "azure-blob",
        }
    }

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, CacheError> {
        let response = self
            .send(reqwest::Method::GET, name, BTreeMap::new(), Bytes::new())
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let expires_at_millis = response
            .headers()
            .get(self.dialect.meta_header())
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.bytes().await?;
        Ok(Some(StoredObject {
            body,
            expires_at_millis,
        }))
    }

    async fn put_object(
        &self,
        name: &str,
        body: Bytes,
        expires_at_millis: Option<u64>,
    ) -> Result<(), CacheError> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        if let Some(expires_at) = expires_at_millis {
            headers.insert(self.dialect.meta_header().to_string(), expires_at.to_string());
        }
        if matches!(self.dialect, StoreDialect::Azure { .. }) {
            headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());
        }
        let response = self.send(reqwest::Method::PUT, name, headers, body).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn delete_object(&self, name: &str) -> Result<(), CacheError> {
        let response = self
            .send(reqwest::Method::DELETE, name, BTreeMap::new(), Bytes::new())
            .await?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response).await)
    }
}

/// Process-local store for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory-object-store"
    }

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, CacheError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned())
    }

    async fn put_object(
        &self,
        name: &str,
        body: Bytes,
        expires_at_millis: Option<u64>,
    ) -> Result<(), CacheError> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(
            name.to_string(),
            StoredObject {
                body,
                expires_at_millis,
            },
        );
        Ok(())
    }

    async fn delete_object(&self, name: &str) -> Result<(), CacheError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }
}

/// [`CacheBackend`] over any [`ObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreCache {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.prefix = prefix;
        self
    }

    pub(crate) fn object_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, hex_encode(&Sha256::digest(key.as_bytes())))
    }
}

fn now_millis() -> u64 {
    u64::try_from(crate::utils::unix_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CacheBackend for ObjectStoreCache {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let name = self.object_name(key);
        let Some(object) = self.store.get_object(&name).await? else {
            return Ok(None);
        };
        if object
            .expires_at_millis
            .is_some_and(|expires_at| now_millis() >= expires_at)
        {
            if let Err(err) = self.store.delete_object(&name).await {
                tracing::debug!(store = self.store.name(), error = %err, "failed to delete expired object");
            }
            return Ok(None);
        }
        Ok(Some(object.body))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| {
            now_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        });
        self.store
            .put_object(&self.object_name(key), value, expires_at)
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete_object(&self.object_name(key)).await
    }
}
