//! Core data types for buildrelay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::storage::ArtifactRef;

/// Artifact name prefix for workspace checkpoints.
pub const DEFAULT_CHECKPOINT_PREFIX: &str = "build-artifact";

/// Artifact name prefix for published build output.
pub const DEFAULT_FINAL_PREFIX: &str = "chromium";

/// Build target flavor. Selects artifact name suffixes and build flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformVariant {
    #[default]
    Default,
    X86,
    Arm,
}

impl PlatformVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformVariant::Default => "default",
            PlatformVariant::X86 => "x86",
            PlatformVariant::Arm => "arm",
        }
    }

    /// Suffix appended to every artifact name for this variant.
    pub fn suffix(&self) -> &'static str {
        match self {
            PlatformVariant::Default => "",
            PlatformVariant::X86 => "-x86",
            PlatformVariant::Arm => "-arm",
        }
    }

    /// Extra arguments handed to the build tool.
    pub fn build_flags(&self) -> &'static [&'static str] {
        match self {
            PlatformVariant::Default => &[],
            PlatformVariant::X86 => &["--x86"],
            PlatformVariant::Arm => &["--arm"],
        }
    }

    pub fn artifact_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.suffix())
    }

    pub fn checkpoint_artifact_name(&self) -> String {
        self.artifact_name(DEFAULT_CHECKPOINT_PREFIX)
    }

    pub fn final_artifact_name(&self) -> String {
        self.artifact_name(DEFAULT_FINAL_PREFIX)
    }
}

impl fmt::Display for PlatformVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "default" => Ok(PlatformVariant::Default),
            "x86" => Ok(PlatformVariant::X86),
            "arm" | "arm64" => Ok(PlatformVariant::Arm),
            _ => Err(format!("Unknown platform variant: {}", s)),
        }
    }
}

/// Immutable input to one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// A previous invocation already completed the build
    pub finished: bool,

    /// Restore the workspace checkpoint before building
    pub resume_from_checkpoint: bool,

    pub variant: PlatformVariant,

    /// CI run identifier, scopes diagnostic bundle names
    pub run_id: String,

    /// CI job identifier, scopes diagnostic bundle names
    pub job_id: String,
}

impl RunRequest {
    pub fn new(variant: PlatformVariant) -> Self {
        RunRequest {
            finished: false,
            resume_from_checkpoint: false,
            variant,
            run_id: "local".to_string(),
            job_id: "0".to_string(),
        }
    }

    /// Build the variant from the legacy `x86` / `arm` boolean inputs.
    pub fn from_arch_flags(x86: bool, arm: bool) -> Result<PlatformVariant, String> {
        match (x86, arm) {
            (true, true) => Err("x86 and arm are mutually exclusive".to_string()),
            (true, false) => Ok(PlatformVariant::X86),
            (false, true) => Ok(PlatformVariant::Arm),
            (false, false) => Ok(PlatformVariant::Default),
        }
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = finished;
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume_from_checkpoint = resume;
        self
    }

    pub fn with_ids(mut self, run_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.job_id = job_id.into();
        self
    }
}

/// Classified result of one build subprocess execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    /// The build tool detected a patch or compilation defect
    BuildOrPatchFailure { exit_code: i32 },
    /// External interruption: job timeout, cancellation, kill
    TimeoutOrCancelled { exit_code: i32 },
}

impl BuildOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildOutcome::Success => 0,
            BuildOutcome::BuildOrPatchFailure { exit_code }
            | BuildOutcome::TimeoutOrCancelled { exit_code } => *exit_code,
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, BuildOutcome::TimeoutOrCancelled { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOutcome::Success => "success",
            BuildOutcome::BuildOrPatchFailure { .. } => "build_or_patch_failure",
            BuildOutcome::TimeoutOrCancelled { .. } => "timeout_or_cancelled",
        }
    }
}

/// Reject files found after a failed build and the bundle they were uploaded as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    /// Bundle artifact name, unique per run/job
    pub name: String,

    /// Reject files, relative to the workspace root
    pub files: Vec<PathBuf>,

    /// Whether the upload went through
    pub uploaded: bool,
}

impl DiagnosticBundle {
    pub fn bundle_name(run_id: &str, job_id: &str) -> String {
        format!("patch-rejects-{}-{}", run_id, job_id)
    }
}

/// Final build output published under the variant's final artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalPackage {
    pub artifact_name: String,
    /// Package files, relative to the output directory
    pub files: Vec<PathBuf>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// The request was already marked finished; nothing ran
    AlreadyFinished,
    /// The build succeeded and its output was published
    Published,
    /// The build was interrupted and the workspace checkpointed
    Checkpointed,
    /// The build tool reported a deterministic failure
    BuildFailed { exit_code: i32 },
}

impl RunStatus {
    /// The `finished` output. `None` means the run failed and produced no output.
    pub fn finished(&self) -> Option<bool> {
        match self {
            RunStatus::AlreadyFinished | RunStatus::Published => Some(true),
            RunStatus::Checkpointed => Some(false),
            RunStatus::BuildFailed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::BuildFailed { .. })
    }
}

/// Everything one invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub outcome: Option<BuildOutcome>,
    pub diagnostics: Option<DiagnosticBundle>,
    pub package: Option<FinalPackage>,
    pub checkpoint: Option<ArtifactRef>,
}

impl RunReport {
    pub fn new(status: RunStatus) -> Self {
        RunReport {
            status,
            outcome: None,
            diagnostics: None,
            package: None,
            checkpoint: None,
        }
    }

    pub fn finished(&self) -> Option<bool> {
        self.status.finished()
    }
}
