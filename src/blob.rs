//! Blob store access.
//!
//! The worker only ever needs three primitives: list keys under a prefix,
//! fetch an object, and write an object. Cloud-specific clients implement
//! [`BlobStore`] behind this seam; the crate ships an in-memory store for
//! tests and local runs and a filesystem store for development against real
//! shard files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A `(bucket, key prefix)` pair naming a set of objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub prefix: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal object-store surface used by the worker.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Object keys under `prefix`, lexicographically sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error>;

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), Error>;
}

/// In-memory store backed by a sorted map.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
        self.lock()
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }
}

/// Filesystem store: buckets are directories under `root`, keys are relative
/// paths within a bucket.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        let base = self.root.join(bucket);
        if !base.exists() {
            return Ok(vec![]);
        }

        let mut keys = Vec::new();
        let mut pending: Vec<PathBuf> = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = relative_key(&base, &path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error> {
        let path = self.object_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let mut key = String::new();
    for component in relative.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(key)
}
