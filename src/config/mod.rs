//! Run configuration.
//!
//! `RunConfig` carries everything about a run that is not part of the
//! per-invocation `RunRequest`: where the workspace lives, how the build is
//! invoked, artifact naming, retry and retention policy.
//!
//! # Configuration Flow
//!
//! 1. `loader` reads a JSON file (explicit path or the global default)
//! 2. Missing fields take the defaults below (`#[serde(default)]`)
//! 3. CLI flags override individual fields
//! 4. `validate` runs before the orchestrator is built

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::archive::{ArchiverKind, DEFAULT_ARCHIVE_LEVEL};
use crate::error::ConfigError;
use crate::models::{PlatformVariant, DEFAULT_CHECKPOINT_PREFIX, DEFAULT_FINAL_PREFIX};
use crate::orchestrator::diagnostics::DEFAULT_REJECT_EXTENSION;
use crate::storage::{RetryPolicy, UploadOptions};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Build workspace. Relative paths below are resolved against it.
    pub workspace_root: PathBuf,
    /// Archive only this subdirectory of the workspace
    pub checkpoint_subdir: Option<PathBuf>,
    /// Where the build writes its final packages
    pub output_dir: PathBuf,
    /// Glob matched against file names in `output_dir`
    pub package_pattern: String,

    pub build_program: String,
    pub build_args: Vec<String>,

    pub checkpoint_prefix: String,
    pub final_prefix: String,
    pub reject_extension: String,

    pub retry: RetryPolicy,
    /// Days the store keeps checkpoints, packages and diagnostics
    pub retention_days: u32,
    /// Gzip level for checkpoint archives (0-9)
    pub archive_level: u32,
    pub archiver: ArchiverKind,
    /// Pause between an interrupted build and archiving
    pub settle_delay_secs: u64,

    /// Root of the directory-backed artifact store
    pub store_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub echo_build_output: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            workspace_root: PathBuf::from("."),
            checkpoint_subdir: None,
            output_dir: PathBuf::from("build"),
            package_pattern: "*".to_string(),
            build_program: "python".to_string(),
            build_args: vec!["build.py".to_string(), "--ci".to_string()],
            checkpoint_prefix: DEFAULT_CHECKPOINT_PREFIX.to_string(),
            final_prefix: DEFAULT_FINAL_PREFIX.to_string(),
            reject_extension: DEFAULT_REJECT_EXTENSION.to_string(),
            retry: RetryPolicy::default(),
            retention_days: 1,
            archive_level: DEFAULT_ARCHIVE_LEVEL,
            archiver: ArchiverKind::Native,
            settle_delay_secs: 5,
            store_root: None,
            log_dir: None,
            echo_build_output: true,
        }
    }
}

impl RunConfig {
    /// Default config rooted at `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        RunConfig {
            workspace_root: workspace_root.into(),
            ..RunConfig::default()
        }
    }

    /// `path` as-is when absolute, otherwise under the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.resolve(&self.output_dir)
    }

    pub fn checkpoint_artifact_name(&self, variant: PlatformVariant) -> String {
        variant.artifact_name(&self.checkpoint_prefix)
    }

    pub fn final_artifact_name(&self, variant: PlatformVariant) -> String {
        variant.artifact_name(&self.final_prefix)
    }

    /// Store-side compression is off for every upload: checkpoints are
    /// already gzipped and packages are archives.
    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions::new(self.retention_days, 0)
    }

    /// Directories the run writes to itself. Checkpoints leave them out when
    /// they sit inside the workspace.
    pub fn checkpoint_exclusions(&self) -> Vec<PathBuf> {
        self.log_dir.iter().chain(self.store_root.iter()).cloned().collect()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Check the config for values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "build_program cannot be empty".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.archive_level > 9 {
            return Err(ConfigError::ValidationFailed(format!(
                "archive_level must be between 0 and 9, got {}",
                self.archive_level
            )));
        }
        if self.package_pattern.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "package_pattern cannot be empty".to_string(),
            ));
        }
        for (field, prefix) in [
            ("checkpoint_prefix", &self.checkpoint_prefix),
            ("final_prefix", &self.final_prefix),
        ] {
            if prefix.is_empty() || prefix.contains(['/', '\\']) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be a non-empty name without path separators, got {:?}",
                    field, prefix
                )));
            }
        }
        if let Some(ref subdir) = self.checkpoint_subdir {
            let escapes = subdir
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(ConfigError::ValidationFailed(format!(
                    "checkpoint_subdir must be a relative path inside the workspace, got {}",
                    subdir.display()
                )));
            }
        }
        Ok(())
    }
}
