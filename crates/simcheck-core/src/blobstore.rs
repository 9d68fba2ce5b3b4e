use dashmap::DashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::error::Error;

/// Content store for raw file bytes and generated artifacts, addressed by
/// storage key. File bytes live under `blobs/<content_hash>`, generated
/// reports under `runs/<run_id>/…`.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), Error>;
    fn contains(&self, key: &str) -> bool;
}

/// Filesystem-backed blob store rooted at a directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        fs::read(self.path_for(key))
            .map_err(|e| Error::StorageUnavailable(format!("{key}: {e}")))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), Error> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(format!("{key}: {e}")))?;
        }
        fs::write(&path, bytes).map_err(|e| Error::StorageUnavailable(format!("{key}: {e}")))?;
        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }
}

/// In-memory blob store for tests.
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.blobs
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StorageUnavailable(format!("{key}: no such blob")))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), Error> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }
}
