use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::ApiError;

/// Storage tag stored on records whose content lives in this store.
pub const STORAGE_TAG: &str = "fs";

/// Content-addressed filesystem store for record content above the
/// external-storage threshold.
///
/// Layout per record:
///   `<root>/<pod>/<streamPath>/.storage/<contentHash>` — the content file
///   `<root>/<pod>/<streamPath>/<name>` — a name-link holding the hash
///
/// Soft delete removes the name-link; purge removes the content file.
/// Multiple names may link the same hash (identical content), so purge is
/// what actually destroys bytes.
pub struct BlobService {
    root: PathBuf,
    cdn_base: Option<String>,
}

impl BlobService {
    pub fn new(root: impl Into<PathBuf>, cdn_base: Option<String>) -> Self {
        Self {
            root: root.into(),
            cdn_base,
        }
    }

    pub async fn ensure_root(&self) -> Result<(), ApiError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn stream_dir(&self, pod: &str, stream_path: &str) -> PathBuf {
        let mut dir = self.root.join(pod);
        for segment in stream_path.split('/') {
            dir.push(segment);
        }
        dir
    }

    fn content_path(&self, pod: &str, stream_path: &str, content_hash: &str) -> PathBuf {
        self.stream_dir(pod, stream_path)
            .join(".storage")
            .join(content_hash)
    }

    fn link_path(&self, pod: &str, stream_path: &str, name: &str) -> PathBuf {
        self.stream_dir(pod, stream_path).join(name)
    }

    /// Write content and its name-link. Returns the storage tag recorded on
    /// the record row. Idempotent per content hash.
    pub async fn put(
        &self,
        pod: &str,
        stream_path: &str,
        name: &str,
        content_hash: &str,
        bytes: &[u8],
    ) -> Result<String, ApiError> {
        let content_path = self.content_path(pod, stream_path, content_hash);
        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if !path_exists(&content_path).await {
            fs::write(&content_path, bytes).await?;
        }
        fs::write(self.link_path(pod, stream_path, name), content_hash).await?;

        tracing::debug!(
            pod,
            stream_path,
            name,
            content_hash,
            size = bytes.len(),
            "stored external blob"
        );

        Ok(STORAGE_TAG.to_string())
    }

    /// Read content bytes by hash.
    pub async fn get(
        &self,
        pod: &str,
        stream_path: &str,
        content_hash: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let path = self.content_path(pod, stream_path, content_hash);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ApiError::Storage(format!("blob {} missing", content_hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Public URL for a 302 redirect when a CDN base is configured.
    pub fn public_url(&self, pod: &str, stream_path: &str, content_hash: &str) -> Option<String> {
        self.cdn_base.as_ref().map(|base| {
            format!("{}/{}/{}/.storage/{}", base, pod, stream_path, content_hash)
        })
    }

    /// Remove the name-link (soft delete). The content file stays until a
    /// purge since other names may still reference it.
    pub async fn delete_name(
        &self,
        pod: &str,
        stream_path: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        remove_if_exists(&self.link_path(pod, stream_path, name)).await
    }

    /// Remove the content file (purge).
    pub async fn purge(
        &self,
        pod: &str,
        stream_path: &str,
        content_hash: &str,
    ) -> Result<(), ApiError> {
        remove_if_exists(&self.content_path(pod, stream_path, content_hash)).await
    }

    /// Best-effort unlink used when a record commit fails after its blob
    /// was written.
    pub async fn rollback(&self, pod: &str, stream_path: &str, name: &str, content_hash: &str) {
        if let Err(e) = self.delete_name(pod, stream_path, name).await {
            tracing::warn!("blob rollback: failed to remove name-link: {}", e);
        }
        if let Err(e) = self.purge(pod, stream_path, content_hash).await {
            tracing::warn!("blob rollback: failed to remove content file: {}", e);
        }
    }

    /// Remove a whole stream directory (stream deletion cascades).
    pub async fn delete_stream(&self, pod: &str, stream_path: &str) -> Result<(), ApiError> {
        remove_dir_if_exists(&self.stream_dir(pod, stream_path)).await
    }

    /// Remove a whole pod directory (pod deletion cascades).
    pub async fn delete_pod(&self, pod: &str) -> Result<(), ApiError> {
        remove_dir_if_exists(&self.root.join(pod)).await
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

async fn remove_if_exists(path: &Path) -> Result<(), ApiError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), ApiError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::content_hash;

    fn temp_store(cdn: Option<String>) -> BlobService {
        let dir = std::env::temp_dir().join(format!("webpods-test-{}", uuid::Uuid::new_v4()));
        BlobService::new(dir, cdn)
    }

    #[tokio::test]
    async fn test_put_creates_content_and_name_link() {
        let store = temp_store(None);
        let bytes = b"png-bytes";
        let hash = content_hash(bytes);

        let tag = store
            .put("alice", "images/large", "big", &hash, bytes)
            .await
            .unwrap();
        assert_eq!(tag, STORAGE_TAG);

        let content = store.get("alice", "images/large", &hash).await.unwrap();
        assert_eq!(content, bytes);

        let link = store.link_path("alice", "images/large", "big");
        assert_eq!(fs::read_to_string(link).await.unwrap(), hash);

        store.delete_pod("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_name_keeps_content() {
        let store = temp_store(None);
        let bytes = b"shared";
        let hash = content_hash(bytes);
        store.put("alice", "docs", "a", &hash, bytes).await.unwrap();
        store.put("alice", "docs", "b", &hash, bytes).await.unwrap();

        store.delete_name("alice", "docs", "a").await.unwrap();
        assert!(!path_exists(&store.link_path("alice", "docs", "a")).await);
        assert_eq!(store.get("alice", "docs", &hash).await.unwrap(), bytes);

        store.delete_pod("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_content() {
        let store = temp_store(None);
        let bytes = b"secret";
        let hash = content_hash(bytes);
        store.put("alice", "docs", "s", &hash, bytes).await.unwrap();

        store.purge("alice", "docs", &hash).await.unwrap();
        assert!(store.get("alice", "docs", &hash).await.is_err());
        // Purge is idempotent.
        store.purge("alice", "docs", &hash).await.unwrap();

        store.delete_pod("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_public_url_under_cdn_base() {
        let store = temp_store(Some("https://cdn.example.com".to_string()));
        let url = store.public_url("alice", "images/large", "abc123").unwrap();
        assert_eq!(
            url,
            "https://cdn.example.com/alice/images/large/.storage/abc123"
        );

        let no_cdn = temp_store(None);
        assert!(no_cdn.public_url("alice", "images/large", "abc123").is_none());
    }
}
