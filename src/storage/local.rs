//! Directory-backed artifact store.
//!
//! Each artifact lives in `<root>/<name>/` with its files under `files/` and
//! its `ArtifactRef` in `artifact.json`. Uploads are staged in a hidden
//! sibling directory and renamed into place, so a failed upload never leaves
//! a half-written artifact behind.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};

use super::{resolve_upload_entries, ArtifactRef, ArtifactStore, UploadOptions};
use crate::error::StoreError;

const METADATA_FILE: &str = "artifact.json";
const FILES_DIR: &str = "files";

/// Artifact store rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    async fn read_ref(&self, name: &str) -> Result<ArtifactRef, StoreError> {
        let metadata_path = self.artifact_dir(name)?.join(METADATA_FILE);
        let content = match tokio::fs::read_to_string(&metadata_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Metadata(format!("{}: {}", metadata_path.display(), e)))
    }
}

/// Artifact names become directory names; keep them to one path component.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::Metadata(format!("invalid artifact name: {:?}", name)))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn find(&self, name: &str) -> BoxFuture<'_, Result<ArtifactRef, StoreError>> {
        let name = name.to_string();
        async move {
            let artifact = self.read_ref(&name).await?;
            if artifact.is_expired(Utc::now()) {
                log::info!("[Store] Artifact '{}' expired at {:?}", name, artifact.expires_at);
                return Err(StoreError::NotFound(name));
            }
            Ok(artifact)
        }
        .boxed()
    }

    fn download(
        &self,
        artifact: ArtifactRef,
        dest_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<PathBuf>, StoreError>> {
        async move {
            let current = self.read_ref(&artifact.name).await?;
            if current.id != artifact.id {
                return Err(StoreError::NotFound(format!(
                    "{} (id {} replaced by {})",
                    artifact.name, artifact.id, current.id
                )));
            }

            let files_dir = self.artifact_dir(&artifact.name)?.join(FILES_DIR);
            let mut written = Vec::with_capacity(current.files.len());
            for relative in &current.files {
                let target = dest_dir.join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(files_dir.join(relative), &target).await?;
                written.push(target);
            }
            Ok(written)
        }
        .boxed()
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        async move {
            let dir = self.artifact_dir(&name)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StoreError::NotFound(name))
                }
                Err(e) => Err(StoreError::Io(e)),
            }
        }
        .boxed()
    }

    fn upload(
        &self,
        name: &str,
        files: Vec<PathBuf>,
        base_dir: PathBuf,
        options: UploadOptions,
    ) -> BoxFuture<'_, Result<ArtifactRef, StoreError>> {
        let name = name.to_string();
        async move {
            let target = self.artifact_dir(&name)?;
            if tokio::fs::try_exists(&target).await? {
                return Err(StoreError::Conflict(name));
            }
            let entries = resolve_upload_entries(&files, &base_dir)?;

            let created_at = Utc::now();
            let id = created_at.timestamp_micros().max(0) as u64;
            let staging = self.root.join(format!(".{}.partial-{}", name, id));
            let staged_files = staging.join(FILES_DIR);
            tokio::fs::create_dir_all(&staged_files).await?;

            let result = async {
                let mut size = 0u64;
                for (relative, absolute) in &entries {
                    let dest = staged_files.join(relative);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    size += tokio::fs::copy(absolute, &dest).await?;
                }

                let artifact = ArtifactRef {
                    id,
                    name: name.clone(),
                    size,
                    files: entries.iter().map(|(rel, _)| rel.clone()).collect(),
                    created_at,
                    expires_at: options.expiry_from(created_at),
                };
                let metadata = serde_json::to_string_pretty(&artifact)
                    .map_err(|e| StoreError::Metadata(e.to_string()))?;
                tokio::fs::write(staging.join(METADATA_FILE), metadata).await?;
                tokio::fs::rename(&staging, &target).await?;
                Ok::<_, StoreError>(artifact)
            }
            .await;

            if result.is_err() {
                let _ = tokio::fs::remove_dir_all(&staging).await;
            }
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace_with_package() -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::create_dir_all(temp_dir.path().join("out")).unwrap();
        std::fs::write(temp_dir.path().join("out/pkg-1.tar"), b"payload").unwrap();
        temp_dir
    }

    #[tokio::test]
    async fn test_upload_find_download_round_trip() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(store_dir.path());
        let src = workspace_with_package();

        let uploaded = store
            .upload(
                "chromium-x86",
                vec![PathBuf::from("out/pkg-1.tar")],
                src.path().to_path_buf(),
                UploadOptions::new(1, 0),
            )
            .await
            .unwrap();
        assert_eq!(uploaded.size, 7);
        assert!(uploaded.expires_at.is_some());

        let found = store.find("chromium-x86").await.unwrap();
        assert_eq!(found, uploaded);

        let dest = TempDir::new().unwrap();
        let files = store.download(found, dest.path().to_path_buf()).await.unwrap();
        assert_eq!(files, vec![dest.path().join("out/pkg-1.tar")]);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_upload_to_existing_name_conflicts_until_deleted() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(store_dir.path());
        let src = workspace_with_package();
        let upload = || {
            store.upload(
                "build-artifact",
                vec![PathBuf::from("out/pkg-1.tar")],
                src.path().to_path_buf(),
                UploadOptions::default(),
            )
        };

        upload().await.unwrap();
        assert!(matches!(upload().await, Err(StoreError::Conflict(_))));
        store.delete("build-artifact").await.unwrap();
        assert!(upload().await.is_ok());
    }

    #[tokio::test]
    async fn test_find_and_delete_missing() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(store_dir.path());
        assert!(store.find("build-artifact").await.unwrap_err().is_not_found());
        assert!(store.delete("build-artifact").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_artifact() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(store_dir.path());
        let src = TempDir::new().unwrap();

        let result = store
            .upload(
                "chromium",
                vec![PathBuf::from("missing.tar")],
                src.path().to_path_buf(),
                UploadOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert!(store.find("chromium").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("build-artifact-arm").is_ok());
        assert!(validate_name("patch-rejects-123-build_x86").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
    }
}
