//! Unified error type hierarchy for buildrelay
//!
//! Provides structured error handling with StoreError, BlobError, ArchiveError,
//! RestoreError, CheckpointError, PublishError, BuildError, ConfigError and the
//! top-level RunError.

use std::io;
use thiserror::Error;

/// Errors raised by an artifact store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact already exists: {0}")]
    Conflict(String),

    #[error("Artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid artifact metadata: {0}")]
    Metadata(String),

    #[error("IO error in artifact store: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors surfaced by the retrying blob client.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Upload of '{name}' failed after {attempts} attempt(s): {last_error}")]
    UploadFailed {
        name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("No artifact named '{0}'")]
    NotFound(String),

    #[error("Download of '{name}' failed: {source}")]
    Download {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Archive compression/extraction errors.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive command '{program}' exited with {code:?}")]
    CommandFailed { program: String, code: Option<i32> },

    #[error("Failed to launch archive command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Archive source not found: {0}")]
    SourceMissing(String),

    #[error("Archive worker failed: {0}")]
    Task(String),

    #[error("IO error during archiving: {0}")]
    Io(#[from] io::Error),
}

/// Checkpoint restore errors. Always fatal to the run.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("No checkpoint '{0}' to resume from")]
    Missing(String),

    #[error("Checkpoint download failed: {0}")]
    Download(BlobError),

    #[error("Checkpoint '{name}' did not contain an archive")]
    EmptyArtifact { name: String },

    #[error("Failed to create restore staging directory: {0}")]
    Staging(io::Error),

    #[error("Checkpoint extraction failed: {0}")]
    Extract(#[from] ArchiveError),

    #[error("Failed to remove local checkpoint archive: {0}")]
    Cleanup(io::Error),
}

impl From<BlobError> for RestoreError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(name) => RestoreError::Missing(name),
            other => RestoreError::Download(other),
        }
    }
}

/// Checkpoint save errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to archive workspace: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Failed to stage checkpoint archive: {0}")]
    Staging(io::Error),

    #[error(transparent)]
    Upload(#[from] BlobError),
}

/// Final package publish errors.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("No output packages matched '{pattern}'")]
    NoPackages { pattern: String },

    #[error("Invalid package pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Upload(#[from] BlobError),
}

/// Build subprocess errors. A non-zero exit code is NOT an error.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to spawn build process '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Build process did not report an exit status: {0}")]
    NoExitStatus(String),

    #[error("IO error while supervising build: {0}")]
    Io(#[from] io::Error),
}

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Fatal run errors. A build failure is reported through `RunStatus`, not here.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Resume failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("Build supervision failed: {0}")]
    Build(#[from] BuildError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

pub type Result<T> = std::result::Result<T, RunError>;
