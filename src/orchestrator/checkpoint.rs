//! Workspace checkpoints.
//!
//! `save` archives the workspace into a staging directory outside of it and
//! replaces the variant's checkpoint artifact. `restore` downloads that
//! artifact into its own staging directory, extracts it over the workspace
//! root and drops the local archive.
//!
//! Directories the run itself writes to (logs, a local artifact store) are
//! excluded from the archive when they live inside the workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::archive::{Archiver, ARCHIVE_FILE_NAME};
use crate::error::{ArchiveError, CheckpointError, RestoreError};
use crate::models::{PlatformVariant, DEFAULT_CHECKPOINT_PREFIX};
use crate::storage::{ArtifactRef, BlobClient, UploadOptions};

pub struct CheckpointManager {
    client: BlobClient,
    archiver: Arc<dyn Archiver>,
    workspace_root: PathBuf,
    /// Only this subdirectory of the workspace is archived
    include: Option<PathBuf>,
    /// Never archived, wherever they are
    exclude: Vec<PathBuf>,
    prefix: String,
    options: UploadOptions,
    settle_delay: Duration,
}

impl CheckpointManager {
    pub fn new(client: BlobClient, archiver: Arc<dyn Archiver>, workspace_root: impl Into<PathBuf>) -> Self {
        CheckpointManager {
            client,
            archiver,
            workspace_root: workspace_root.into(),
            include: None,
            exclude: Vec::new(),
            prefix: DEFAULT_CHECKPOINT_PREFIX.to_string(),
            options: UploadOptions::default(),
            settle_delay: Duration::ZERO,
        }
    }

    pub fn with_subdir(mut self, subdir: Option<PathBuf>) -> Self {
        self.include = subdir;
        self
    }

    /// Leave `paths` out of every checkpoint. Paths outside the workspace
    /// are ignored.
    pub fn with_exclusions(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.exclude.extend(paths);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Retention used for checkpoint uploads. Compression is always off at
    /// the store, the archive is already compressed.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.options = UploadOptions::new(days, 0);
        self
    }

    /// Wait before archiving so killed build processes release their files.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn artifact_name(&self, variant: PlatformVariant) -> String {
        variant.artifact_name(&self.prefix)
    }

    /// Download the variant's checkpoint and extract it into the workspace.
    ///
    /// # Errors
    /// Every failure is fatal: a missing checkpoint, a failed download, a
    /// failed extraction or a local archive that could not be removed.
    pub async fn restore(&self, variant: PlatformVariant) -> Result<ArtifactRef, RestoreError> {
        let name = self.artifact_name(variant);
        log::info!(target: "parsed", "[Checkpoint] Restoring '{}' into {}", name, self.workspace_root.display());

        let staging = staging_dir("buildrelay-restore-").map_err(RestoreError::Staging)?;
        let downloaded = self.client.get(&name, staging.path()).await?;

        let archive = downloaded
            .files
            .iter()
            .find(|f| f.file_name().map_or(false, |n| n == ARCHIVE_FILE_NAME))
            .or_else(|| downloaded.files.first())
            .cloned()
            .ok_or_else(|| RestoreError::EmptyArtifact { name: name.clone() })?;

        let archiver = Arc::clone(&self.archiver);
        let dest = self.workspace_root.clone();
        tokio::task::spawn_blocking(move || archiver.extract(&archive, &dest))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        staging.close().map_err(RestoreError::Cleanup)?;
        log::info!(target: "parsed", "[Checkpoint] Restored '{}' (id {})", name, downloaded.artifact.id);
        Ok(downloaded.artifact)
    }

    /// Archive the workspace and replace the variant's checkpoint artifact.
    pub async fn save(&self, variant: PlatformVariant) -> Result<ArtifactRef, CheckpointError> {
        let name = self.artifact_name(variant);
        if !self.settle_delay.is_zero() {
            log::info!("[Checkpoint] Waiting {:?} for the build to release files", self.settle_delay);
            tokio::time::sleep(self.settle_delay).await;
        }

        let staging = staging_dir("buildrelay-checkpoint-").map_err(CheckpointError::Staging)?;
        let archive = staging.path().join(ARCHIVE_FILE_NAME);
        log::info!(target: "parsed", "[Checkpoint] Archiving {} for '{}'", self.workspace_root.display(), name);

        let archiver = Arc::clone(&self.archiver);
        let root = self.workspace_root.clone();
        let include = self.include.clone();
        let exclude = self.exclude.clone();
        let target = archive.clone();
        tokio::task::spawn_blocking(move || {
            let exclude = workspace_relative(&root, &exclude);
            if !exclude.is_empty() {
                log::info!("[Checkpoint] Excluding {:?}", exclude);
            }
            archiver.compress(&root, include.as_deref(), &exclude, &target)
        })
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        let artifact = self
            .client
            .put(&name, &[PathBuf::from(ARCHIVE_FILE_NAME)], staging.path(), self.options)
            .await?;
        log::info!(target: "parsed", "[Checkpoint] Saved '{}' ({} bytes)", name, artifact.size);
        Ok(artifact)
    }
}

/// `paths` that resolve to somewhere strictly inside `root`, as root-relative
/// paths. Paths that do not exist yet cannot be inside the archive either.
fn workspace_relative(root: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(_) => return Vec::new(),
    };
    paths
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .filter_map(|p| p.strip_prefix(&root).ok().map(Path::to_path_buf))
        .filter(|rel| !rel.as_os_str().is_empty())
        .collect()
}

fn staging_dir(prefix: &str) -> std::io::Result<TempDir> {
    tempfile::Builder::new().prefix(prefix).tempdir()
}
