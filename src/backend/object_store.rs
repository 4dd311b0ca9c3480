use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Blob storage for original files and stage artifacts.
///
/// Keys and URIs are opaque to the core; staging writes to deterministic
/// canonical keys and is overwrite-safe, so a retried ingest re-puts the same
/// key instead of needing compensating deletes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the resulting URI.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>>;

    /// Copies `src` to `dst`, returning where it landed and how large it is.
    /// The size feeds the storage quota accounting at ingest.
    async fn copy(&self, src: &str, dst: &str) -> Result<StoredObject>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub uri: String,
    pub size_bytes: u64,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let uri = format!("mem://{}", key);
        self.objects.write().await.insert(uri.clone(), bytes);
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| PipelineError::Backend(format!("object not found: {}", uri)))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<StoredObject> {
        let bytes = self.get(src).await?;
        let size_bytes = bytes.len() as u64;
        let uri = self.put(dst, bytes).await?;
        Ok(StoredObject { uri, size_bytes })
    }
}

/// Local-filesystem store, enough for single-node deployments.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches("file://"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("file://{}", key))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path_for(uri)).await?)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<StoredObject> {
        let bytes = self.get(src).await?;
        let size_bytes = bytes.len() as u64;
        let uri = self.put(dst, bytes).await?;
        Ok(StoredObject { uri, size_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_and_copies() {
        let store = MemoryObjectStore::new();
        let uri = store.put("raw/d1.pdf", b"pdf-bytes".to_vec()).await.unwrap();
        assert_eq!(store.get(&uri).await.unwrap(), b"pdf-bytes");

        let copied = store.copy(&uri, "canonical/d1.pdf").await.unwrap();
        assert_eq!(copied.size_bytes, 9);
        assert_eq!(store.get(&copied.uri).await.unwrap(), b"pdf-bytes");
    }

    #[tokio::test]
    async fn missing_object_is_a_backend_error() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.get("mem://nope").await,
            Err(PipelineError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn fs_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let uri = store.put("canonical/d2.pdf", b"x".to_vec()).await.unwrap();
        assert_eq!(uri, "file://canonical/d2.pdf");
        assert_eq!(store.get(&uri).await.unwrap(), b"x");
    }
}
