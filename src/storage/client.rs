//! Retrying blob client.
//!
//! `put` keeps at most one generation of an artifact alive: any existing blob
//! under the name is deleted (best effort) before each upload attempt, and
//! failed uploads are retried after a fixed backoff up to a fixed attempt cap.
//! `get` is a single find + download.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{ArtifactRef, ArtifactStore, DownloadedArtifact, UploadOptions};
use crate::error::BlobError;

/// Fixed-backoff retry policy for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total upload attempts, including the first
    pub max_attempts: u32,
    /// Wait between a failed attempt and the next one
    #[serde(with = "duration_secs", rename = "backoff_secs")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Blob client over an `ArtifactStore`.
#[derive(Clone)]
pub struct BlobClient {
    store: Arc<dyn ArtifactStore>,
    policy: RetryPolicy,
}

impl BlobClient {
    pub fn new(store: Arc<dyn ArtifactStore>, policy: RetryPolicy) -> Self {
        BlobClient { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Replace artifact `name` with `paths` (located under `base_dir`).
    ///
    /// # Errors
    /// `BlobError::UploadFailed` once every attempt has failed.
    pub async fn put(
        &self,
        name: &str,
        paths: &[PathBuf],
        base_dir: &Path,
        options: UploadOptions,
    ) -> Result<ArtifactRef, BlobError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let atomic = self.store.supports_atomic_overwrite();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if !atomic {
                self.delete_quietly(name).await;
            }

            match self
                .store
                .upload(name, paths.to_vec(), base_dir.to_path_buf(), options)
                .await
            {
                Ok(artifact) => {
                    log::info!(
                        "[Blob] Uploaded '{}' ({} file(s), {} bytes) on attempt {}/{}",
                        name,
                        artifact.files.len(),
                        artifact.size,
                        attempt,
                        max_attempts
                    );
                    return Ok(artifact);
                }
                Err(e) => {
                    log::warn!(
                        "[Blob] Upload of '{}' failed on attempt {}/{}: {}",
                        name,
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        log::error!("[Blob] Giving up on '{}' after {} attempt(s)", name, max_attempts);
        Err(BlobError::UploadFailed {
            name: name.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Single upload attempt with no delete and no retry.
    pub async fn upload_once(
        &self,
        name: &str,
        paths: &[PathBuf],
        base_dir: &Path,
        options: UploadOptions,
    ) -> Result<ArtifactRef, BlobError> {
        self.store
            .upload(name, paths.to_vec(), base_dir.to_path_buf(), options)
            .await
            .map_err(|e| BlobError::UploadFailed {
                name: name.to_string(),
                attempts: 1,
                last_error: e.to_string(),
            })
    }

    /// Resolve artifact `name` and download it into `dest_dir`.
    pub async fn get(&self, name: &str, dest_dir: &Path) -> Result<DownloadedArtifact, BlobError> {
        let artifact = match self.store.find(name).await {
            Ok(artifact) => artifact,
            Err(e) if e.is_not_found() => return Err(BlobError::NotFound(name.to_string())),
            Err(e) => {
                return Err(BlobError::Download {
                    name: name.to_string(),
                    source: e,
                })
            }
        };

        log::info!(
            "[Blob] Downloading '{}' (id {}, {} bytes) into {}",
            name,
            artifact.id,
            artifact.size,
            dest_dir.display()
        );
        let files = self
            .store
            .download(artifact.clone(), dest_dir.to_path_buf())
            .await
            .map_err(|e| BlobError::Download {
                name: name.to_string(),
                source: e,
            })?;

        Ok(DownloadedArtifact {
            artifact,
            dest_dir: dest_dir.to_path_buf(),
            files,
        })
    }

    /// Delete `name`, ignoring absence and logging anything else.
    pub async fn delete_quietly(&self, name: &str) {
        match self.store.delete(name).await {
            Ok(()) => log::info!("[Blob] Deleted previous '{}'", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("[Blob] Ignoring failed delete of '{}': {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryArtifactStore, StoreCall};
    use tempfile::TempDir;

    fn client(store: &MemoryArtifactStore) -> BlobClient {
        BlobClient::new(Arc::new(store.clone()), RetryPolicy::default())
    }

    fn package_dir(contents: &[u8]) -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::write(temp_dir.path().join("pkg-1.tar"), contents).unwrap();
        temp_dir
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_survives_four_failures() {
        let store = MemoryArtifactStore::new();
        store.fail_next_uploads(4);
        let src = package_dir(b"pkg");

        let started = tokio::time::Instant::now();
        let result = client(&store)
            .put("chromium", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await;

        assert!(result.is_ok());
        assert_eq!(store.upload_calls("chromium"), 5);
        assert!(started.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_gives_up_after_five_failures() {
        let store = MemoryArtifactStore::new();
        store.fail_next_uploads(5);
        let src = package_dir(b"pkg");

        let err = client(&store)
            .put("chromium", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BlobError::UploadFailed { attempts: 5, .. }));
        assert_eq!(store.upload_calls("chromium"), 5);
        assert!(!store.contains("chromium"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_deletes_before_uploading() {
        let store = MemoryArtifactStore::new();
        let src = package_dir(b"pkg");
        client(&store)
            .put("build-artifact", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls[0], StoreCall::Delete("build-artifact".into()));
        assert!(matches!(calls[1], StoreCall::Upload { ref name, .. } if name == "build-artifact"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_twice_keeps_one_generation() {
        let store = MemoryArtifactStore::new();
        let client = client(&store);

        let first = package_dir(b"first");
        client
            .put("chromium", &[PathBuf::from("pkg-1.tar")], first.path(), UploadOptions::default())
            .await
            .unwrap();
        let second = package_dir(b"second");
        client
            .put("chromium", &[PathBuf::from("pkg-1.tar")], second.path(), UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let contents = store.contents("chromium").unwrap();
        assert_eq!(contents[&PathBuf::from("pkg-1.tar")], b"second".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_ignores_delete_failures() {
        let store = MemoryArtifactStore::new();
        store.fail_deletes(true);
        let src = package_dir(b"pkg");

        let result = client(&store)
            .put("chromium", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_store_skips_delete() {
        let store = MemoryArtifactStore::with_atomic_overwrite();
        let src = package_dir(b"pkg");
        client(&store)
            .put("chromium", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await
            .unwrap();

        assert!(store
            .calls()
            .iter()
            .all(|c| !matches!(c, StoreCall::Delete(_))));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryArtifactStore::new();
        let dest = TempDir::new().unwrap();
        let err = client(&store).get("build-artifact", dest.path()).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(ref n) if n == "build-artifact"));
    }

    #[tokio::test]
    async fn test_upload_once_does_not_retry() {
        let store = MemoryArtifactStore::new();
        store.fail_all_uploads(true);
        let src = package_dir(b"pkg");

        let err = client(&store)
            .upload_once("patch-rejects-1-1", &[PathBuf::from("pkg-1.tar")], src.path(), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::UploadFailed { attempts: 1, .. }));
        assert_eq!(store.upload_calls("patch-rejects-1-1"), 1);
    }

    #[test]
    fn test_retry_policy_json() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts":3,"backoff_secs":2}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(2));
        let defaults: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, RetryPolicy::default());
    }
}
