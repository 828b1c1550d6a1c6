//! Artifact storage: the named blob store that carries state between runs.
//!
//! - `ArtifactStore`: adapter trait over find/download/delete/upload
//! - `client`: `BlobClient`, bounded retry with fixed backoff on top of a store
//! - `local`: directory-backed store
//! - `memory`: in-process store with fault injection
//!
//! Stores are keyed by artifact name. An upload to a name that is already
//! taken is rejected unless the store supports atomic overwrite, which is why
//! the client deletes before it uploads.

pub mod client;
pub mod local;
pub mod memory;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub use client::{BlobClient, RetryPolicy};
pub use local::LocalArtifactStore;
pub use memory::{MemoryArtifactStore, StoreCall};

/// Handle to an artifact held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: u64,
    pub name: String,
    /// Total payload size in bytes
    pub size: u64,
    /// Files in the artifact, relative to the upload base directory
    pub files: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactRef {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Per-upload options passed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Days the store keeps the artifact. 0 keeps it indefinitely.
    pub retention_days: u32,
    /// Store-side compression level, 0 for payloads that are already compressed
    pub compression_level: u32,
}

impl UploadOptions {
    pub fn new(retention_days: u32, compression_level: u32) -> Self {
        UploadOptions {
            retention_days,
            compression_level,
        }
    }

    pub fn expiry_from(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.retention_days == 0 {
            None
        } else {
            Some(created_at + ChronoDuration::days(i64::from(self.retention_days)))
        }
    }
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            retention_days: 1,
            compression_level: 0,
        }
    }
}

/// Files written to local disk by a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub artifact: ArtifactRef,
    pub dest_dir: PathBuf,
    /// Absolute paths of the downloaded files
    pub files: Vec<PathBuf>,
}

/// Named blob store consumed by the blob client.
pub trait ArtifactStore: Send + Sync {
    /// Resolve an artifact by logical name.
    fn find(&self, name: &str) -> BoxFuture<'_, Result<ArtifactRef, StoreError>>;

    /// Write the artifact's files below `dest_dir`, preserving relative paths.
    fn download(
        &self,
        artifact: ArtifactRef,
        dest_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<PathBuf>, StoreError>>;

    /// Remove an artifact. `StoreError::NotFound` when there is nothing to remove.
    fn delete(&self, name: &str) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Upload `files` (each located under `base_dir`) as artifact `name`.
    fn upload(
        &self,
        name: &str,
        files: Vec<PathBuf>,
        base_dir: PathBuf,
        options: UploadOptions,
    ) -> BoxFuture<'_, Result<ArtifactRef, StoreError>>;

    /// True when `upload` replaces an existing artifact in one step.
    fn supports_atomic_overwrite(&self) -> bool {
        false
    }
}

/// Resolve each upload path to `(relative, absolute)` against `base_dir`.
///
/// Relative inputs are taken relative to `base_dir`. Paths outside of
/// `base_dir` and non-files are rejected.
pub fn resolve_upload_entries(
    files: &[PathBuf],
    base_dir: &Path,
) -> Result<Vec<(PathBuf, PathBuf)>, StoreError> {
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let absolute = if file.is_absolute() {
            file.clone()
        } else {
            base_dir.join(file)
        };
        let relative = absolute.strip_prefix(base_dir).map_err(|_| {
            StoreError::Metadata(format!(
                "{} is not under upload root {}",
                absolute.display(),
                base_dir.display()
            ))
        })?;
        if !absolute.is_file() {
            return Err(StoreError::Metadata(format!(
                "{} is not a regular file",
                absolute.display()
            )));
        }
        entries.push((relative.to_path_buf(), absolute));
    }
    Ok(entries)
}
