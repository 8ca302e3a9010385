//! Blob storage contract for pipeline artifacts.
//!
//! The engine only needs a generic read/write contract: steps upload
//! intermediates (prepared assets, candidates) and record the returned URLs
//! in job metadata. Writes are append-only per job — every attempt uses a
//! fresh path, so re-entered steps can never clobber earlier output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

/// Errors that can occur during blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL does not belong to this store.
    #[error("Invalid blob URL: {0}")]
    InvalidUrl(String),

    /// No blob exists at the given URL.
    #[error("Blob not found: {0}")]
    NotFound(String),
}

/// Generic blob read/write contract.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes bytes under the given relative path and returns a URL.
    async fn put(&self, path: &str, data: &[u8]) -> Result<String, BlobError>;

    /// Reads the bytes behind a URL previously returned by `put`.
    async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError>;
}

/// Filesystem-backed blob store. URLs use the `blob://` scheme and resolve
/// relative to the configured root.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, BlobError> {
        let relative = url
            .strip_prefix("blob://")
            .ok_or_else(|| BlobError::InvalidUrl(url.to_string()))?;
        if relative.is_empty() || relative.contains("..") {
            return Err(BlobError::InvalidUrl(url.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<String, BlobError> {
        let url = format!("blob://{}", path.trim_start_matches('/'));
        let full_path = self.resolve(&url)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, data).await?;

        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        let full_path = self.resolve(url)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(url.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}
