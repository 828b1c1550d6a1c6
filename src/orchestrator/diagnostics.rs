//! Reject file collection after a failed build.
//!
//! Best effort only: nothing in here returns an error. A walk or upload
//! failure is logged and the run keeps its build-failure status.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::DiagnosticBundle;
use crate::storage::{BlobClient, UploadOptions};

/// Extension of the files a failed patch application leaves behind.
pub const DEFAULT_REJECT_EXTENSION: &str = "rej";

pub struct DiagnosticCollector {
    client: BlobClient,
    extension: String,
    retention_days: u32,
}

impl DiagnosticCollector {
    pub fn new(client: BlobClient) -> Self {
        DiagnosticCollector {
            client,
            extension: DEFAULT_REJECT_EXTENSION.to_string(),
            retention_days: 1,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Find reject files under `workspace_root` and upload them once as
    /// `patch-rejects-<run_id>-<job_id>`. `None` when there are no reject files.
    pub async fn collect(&self, workspace_root: &Path, run_id: &str, job_id: &str) -> Option<DiagnosticBundle> {
        let root = workspace_root.to_path_buf();
        let extension = self.extension.clone();
        let files = match tokio::task::spawn_blocking(move || find_reject_files(&root, &extension)).await {
            Ok(files) => files,
            Err(e) => {
                log::warn!("[Diagnostics] Reject file scan did not complete: {}", e);
                return None;
            }
        };

        if files.is_empty() {
            log::info!("[Diagnostics] No .{} files under {}", self.extension, workspace_root.display());
            return None;
        }

        let name = DiagnosticBundle::bundle_name(run_id, job_id);
        log::info!(target: "parsed", "[Diagnostics] Found {} reject file(s), uploading as '{}'", files.len(), name);
        for file in &files {
            log::info!("[Diagnostics]   {}", file.display());
        }

        let uploaded = match self
            .client
            .upload_once(&name, &files, workspace_root, UploadOptions::new(self.retention_days, 0))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[Diagnostics] Ignoring failed upload of '{}': {}", name, e);
                false
            }
        };

        Some(DiagnosticBundle { name, files, uploaded })
    }
}

/// Regular files under `root` whose extension is `extension`, relative to
/// `root` and sorted. Unreadable entries are skipped.
pub fn find_reject_files(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("[Diagnostics] Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().map_or(false, |ext| ext == extension))
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}
