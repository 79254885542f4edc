//! Directory-backed cache backend.
//!
//! Each entry is one file: an 8-byte little-endian expiry (unix seconds, 0 for
//! none) followed by the payload. Writes go through a temp file and a rename.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::store::{CacheBackend, CacheResult};

const HEADER_LEN: usize = 8;

pub struct FilesystemCacheBackend {
    root: PathBuf,
    default_ttl: Option<Duration>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FilesystemCacheBackend {
    pub async fn new(root: PathBuf, default_ttl: Option<Duration>) -> CacheResult<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root, default_ttl })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let file_name = key.replace(':', "_");
        // Last two hex chars shard the directory.
        let shard = &file_name[file_name.len().saturating_sub(2)..];
        self.root.join(shard).join(file_name)
    }
}

#[async_trait]
impl CacheBackend for FilesystemCacheBackend {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let expires_at = ttl
            .or(self.default_ttl)
            .map(|ttl| unix_now() + ttl.as_secs().max(1))
            .unwrap_or(0);

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&expires_at.to_le_bytes()).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if raw.len() < HEADER_LEN {
            warn!(path = %path.display(), "Removing truncated cache entry");
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let expires_at = u64::from_le_bytes(header);
        if expires_at != 0 && unix_now() >= expires_at {
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(Bytes::from(raw).slice(HEADER_LEN..)))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        let _ = fs::remove_dir_all(&self.root).await;
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entry_survives_new_backend_instance() {
        let dir = TempDir::new().unwrap();
        let first = FilesystemCacheBackend::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        first
            .set("audio:00ff", Bytes::from_static(b"payload"), None)
            .await
            .unwrap();

        let second = FilesystemCacheBackend::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        assert_eq!(
            second.get("audio:00ff").await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );

        second.delete("audio:00ff").await.unwrap();
        second.delete("audio:00ff").await.unwrap();
        assert!(second.get("audio:00ff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemCacheBackend::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        let path = backend.entry_path("audio:abcd");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"abc").await.unwrap();

        assert!(backend.get("audio:abcd").await.unwrap().is_none());
        assert!(!path.exists());
    }
}
