//! buildrelay: checkpoint/resume orchestration for builds that do not fit in
//! one CI job.
//!
//! Each invocation restores the previous run's workspace if asked to, runs
//! the build, classifies its exit code and then either publishes the output,
//! checkpoints the workspace for the next invocation, or uploads reject files
//! and fails.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Run request, outcomes and reports
//! - **config**: Run configuration and JSON loader
//! - **storage**: Artifact store trait, adapters and the retrying blob client
//! - **archive**: Workspace archiving (tar + gzip)
//! - **orchestrator**: Classifier, checkpoints, diagnostics, build execution and the run state machine
//! - **log_collector**: Disk-backed `log` backend
//! - **step_output**: Step outputs and exit code handed back to CI

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;

pub mod storage;

pub mod archive;

// Robust, decoupled logging system
pub mod log_collector;

pub mod orchestrator;

pub mod step_output;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    ArchiveError, BlobError, BuildError, CheckpointError, ConfigError, PublishError, RestoreError,
    Result, RunError, StoreError,
};

pub use models::{
    BuildOutcome, DiagnosticBundle, FinalPackage, PlatformVariant, RunReport, RunRequest,
    RunStatus,
};

pub use config::RunConfig;

pub use storage::{
    ArtifactRef, ArtifactStore, BlobClient, LocalArtifactStore, MemoryArtifactStore, RetryPolicy,
    UploadOptions,
};

pub use archive::{Archiver, ArchiverKind, CommandArchiver, TarGzArchiver};

pub use orchestrator::{
    classify, BuildRunner, CheckpointManager, DiagnosticCollector, ProcessBuildRunner,
    RunOrchestrator, RunPhase,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
