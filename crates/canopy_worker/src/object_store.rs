//! Blob storage for artifact payloads.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use canopy_protocol::{ArtifactId, CorrelationId};
use tracing::debug;

use crate::error::{Result, WorkerError};

/// Where an object ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRef {
    pub key: String,
    pub size: u64,
    /// blake3 of the stored bytes, hex.
    pub content_hash: String,
}

impl StoreRef {
    fn for_bytes(key: &str, bytes: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            size: bytes.len() as u64,
            content_hash: blake3::hash(bytes).to_hex().to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StoreRef>;
}

/// Object key for an artifact: `{correlation_id}/{artifact_id}_{filename}`.
pub fn artifact_key(correlation_id: &CorrelationId, artifact_id: &ArtifactId, filename: &str) -> String {
    let filename: String = filename
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}/{}_{}", correlation_id, artifact_id, filename)
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` below the root, refusing anything that could escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(WorkerError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StoreRef> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never see a partially written object.
        let tmp_path = path.with_extension("partial");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(key, size = bytes.len(), "Stored object");
        Ok(StoreRef::for_bytes(key, &bytes))
    }
}

/// In-process store, for tests and single-process demos.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StoreRef> {
        let store_ref = StoreRef::for_bytes(key, &bytes);
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), bytes);
        Ok(store_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_writes_below_root() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());

        let store_ref = store.put("c1/a1_heat.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(store_ref.size, 2);
        assert_eq!(store_ref.content_hash, blake3::hash(b"{}").to_hex().to_string());

        let written = std::fs::read(tmp.path().join("c1/a1_heat.json")).unwrap();
        assert_eq!(written, b"{}");
        assert!(!tmp.path().join("c1/a1_heat.partial").exists());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());

        for key in ["../outside", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.put(key, vec![1]).await, Err(WorkerError::InvalidKey(_))),
                "key {:?} accepted",
                key
            );
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store.put("k", b"payload".to_vec()).await.unwrap();
        assert_eq!(store.get("k").as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_artifact_key_flattens_filename() {
        let correlation_id = CorrelationId::new();
        let artifact_id = ArtifactId::new();
        let key = artifact_key(&correlation_id, &artifact_id, "maps/heat.tif");
        assert_eq!(key, format!("{}/{}_maps_heat.tif", correlation_id, artifact_id));
    }
}
