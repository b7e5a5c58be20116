use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{CacheBackend, CacheError};
use crate::utils::{hex_encode, random_hex, unix_millis};

/// One file per key under `dir`, named by the key digest. Expiry lives in a
/// `<name>.ttl` sidecar holding unix milliseconds.
#[derive(Clone, Debug)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let name = hex_encode(&Sha256::digest(key.as_bytes()));
        (
            self.dir.join(&name),
            self.dir.join(format!("{name}.ttl")),
        )
    }

    async fn expired(ttl_path: &Path) -> Result<bool, CacheError> {
        let raw = match tokio::fs::read_to_string(ttl_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let Ok(expires_at) = raw.trim().parse::<u128>() else {
            return Ok(true);
        };
        Ok(unix_millis() >= expires_at)
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), CacheError> {
        let tmp = self.dir.join(format!(".tmp-{}", random_hex(8)));
        tokio::fs::write(&tmp, contents).await?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let (path, ttl_path) = self.paths(key);
        if Self::expired(&ttl_path).await? {
            remove_if_present(&path).await?;
            remove_if_present(&ttl_path).await?;
            return Ok(None);
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let (path, ttl_path) = self.paths(key);
        match ttl {
            Some(ttl) => {
                let expires_at = unix_millis() + ttl.as_millis();
                self.write_atomic(&ttl_path, expires_at.to_string().as_bytes())
                    .await?;
            }
            None => remove_if_present(&ttl_path).await?,
        }
        self.write_atomic(&path, &value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let (path, ttl_path) = self.paths(key);
        remove_if_present(&path).await?;
        remove_if_present(&ttl_path).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"));
        cache
            .set("key", Bytes::from_static(b"{\"a\":1}"), None)
            .await
            .unwrap();

        let reopened = DiskCache::new(dir.path().join("cache"));
        assert_eq!(
            reopened.get("key").await.unwrap(),
            Some(Bytes::from_static(b"{\"a\":1}"))
        );
        reopened.delete("key").await.unwrap();
        reopened.delete("key").await.unwrap();
        assert_eq!(cache.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache
            .set("key", Bytes::from_static(b"v"), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(cache.get("key").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
        let (path, ttl_path) = cache.paths("key");
        assert!(!path.exists());
        assert!(!ttl_path.exists());
    }

    #[tokio::test]
    async fn overwriting_without_ttl_clears_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache
            .set("key", Bytes::from_static(b"old"), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        cache.set("key", Bytes::from_static(b"new"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            cache.get("key").await.unwrap(),
            Some(Bytes::from_static(b"new"))
        );
    }
}
