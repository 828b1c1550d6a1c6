//! Run orchestration: resume -> build -> classify -> checkpoint | publish | fail.
//!
//! - `classifier`: exit code to `BuildOutcome`
//! - `checkpoint`: workspace save/restore through the blob client
//! - `diagnostics`: best-effort reject file upload
//! - `executor`: the build subprocess
//! - `state`: phase graph
//!
//! A run is strictly sequential. Interruption arrives through the
//! cancellation token: the executor kills the build, the exit code it
//! reports classifies as `TimeoutOrCancelled`, and the checkpoint branch runs
//! like it would for any other interrupted build.

pub mod checkpoint;
pub mod classifier;
pub mod diagnostics;
pub mod executor;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

pub use checkpoint::CheckpointManager;
pub use classifier::classify;
pub use diagnostics::DiagnosticCollector;
pub use executor::{BuildCommand, BuildExit, BuildRunner, ProcessBuildRunner, ScriptedBuildRunner};
pub use state::{RunPhase, RunState};

use crate::archive::{archiver_for, Archiver};
use crate::config::RunConfig;
use crate::error::{PublishError, Result};
use crate::models::{BuildOutcome, FinalPackage, PlatformVariant, RunReport, RunRequest, RunStatus};
use crate::storage::{ArtifactStore, BlobClient};

/// Drives one invocation through the run phases.
#[derive(Clone)]
pub struct RunOrchestrator {
    config: RunConfig,

    client: BlobClient,

    checkpoints: Arc<CheckpointManager>,

    diagnostics: Arc<DiagnosticCollector>,

    runner: Arc<dyn BuildRunner>,

    /// Flipped to `true` by the signal handlers in `main`
    cancel_rx: watch::Receiver<bool>,

    state: Arc<RwLock<RunState>>,
}

impl RunOrchestrator {
    /// Orchestrator over `store` and `runner`, using the archiver the config
    /// selects.
    pub fn new(
        config: RunConfig,
        store: Arc<dyn ArtifactStore>,
        runner: Arc<dyn BuildRunner>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let archiver: Arc<dyn Archiver> = Arc::from(archiver_for(config.archiver, config.archive_level));
        let client = BlobClient::new(store, config.retry);
        let checkpoints = Arc::new(checkpoint_manager(&config, &client, archiver));
        let diagnostics = Arc::new(
            DiagnosticCollector::new(client.clone())
                .with_extension(config.reject_extension.clone())
                .with_retention_days(config.retention_days),
        );

        RunOrchestrator {
            config,
            client,
            checkpoints,
            diagnostics,
            runner,
            cancel_rx,
            state: Arc::new(RwLock::new(RunState::new())),
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.checkpoints = Arc::new(checkpoint_manager(&self.config, &self.client, archiver));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn current_phase(&self) -> RunPhase {
        self.state.read().await.phase()
    }

    /// Phases this run has been through so far.
    pub async fn phase_history(&self) -> Vec<RunPhase> {
        self.state.read().await.phases()
    }

    async fn transition(&self, next: RunPhase) -> Result<()> {
        self.state.write().await.transition_to(next)
    }

    /// Execute one invocation.
    ///
    /// A deterministic build failure is a normal outcome
    /// (`RunStatus::BuildFailed`). `Err` means the run could not do what the
    /// outcome required: restore, spawn, checkpoint or publish failed.
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport> {
        *self.state.write().await = RunState::new();
        let variant = request.variant;

        if request.finished {
            log::info!(target: "parsed", "[Run] Already finished, skipping build");
            self.transition(RunPhase::Done).await?;
            return Ok(RunReport::new(RunStatus::AlreadyFinished));
        }

        if request.resume_from_checkpoint {
            self.transition(RunPhase::Resuming).await?;
            self.checkpoints.restore(variant).await?;
        }

        self.transition(RunPhase::Building).await?;
        let command = BuildCommand::for_variant(
            self.config.build_program.clone(),
            &self.config.build_args,
            variant,
            self.config.workspace_root.clone(),
        );
        let exit = self.runner.run(command, self.cancel_rx.clone()).await?;
        let outcome = classify(exit.exit_code);
        log::info!(
            target: "parsed",
            "[Run] Build exit code {} classified as {}",
            exit.exit_code,
            outcome.as_str()
        );

        let report = match outcome {
            BuildOutcome::Success => {
                self.transition(RunPhase::Succeeded).await?;
                let package = self.publish(variant).await?;
                RunReport {
                    package: Some(package),
                    ..RunReport::new(RunStatus::Published)
                }
            }
            BuildOutcome::BuildOrPatchFailure { exit_code } => {
                self.transition(RunPhase::Failed).await?;
                let diagnostics = self
                    .diagnostics
                    .collect(&self.config.workspace_root, &request.run_id, &request.job_id)
                    .await;
                RunReport {
                    diagnostics,
                    ..RunReport::new(RunStatus::BuildFailed { exit_code })
                }
            }
            BuildOutcome::TimeoutOrCancelled { .. } => {
                self.transition(RunPhase::Checkpointing).await?;
                let checkpoint = self.checkpoints.save(variant).await?;
                RunReport {
                    checkpoint: Some(checkpoint),
                    ..RunReport::new(RunStatus::Checkpointed)
                }
            }
        };

        self.transition(RunPhase::Done).await?;
        log::info!(target: "parsed", "[Run] Done: {:?}", report.status);
        Ok(RunReport {
            outcome: Some(outcome),
            ..report
        })
    }

    /// Upload the build output as the variant's final artifact, replacing
    /// any previous one.
    pub async fn publish(&self, variant: PlatformVariant) -> std::result::Result<FinalPackage, PublishError> {
        let output_dir = self.config.output_path();
        let files = discover_packages(&output_dir, &self.config.package_pattern)?;
        let artifact_name = self.config.final_artifact_name(variant);
        log::info!(
            target: "parsed",
            "[Publish] Uploading {} package(s) as '{}'",
            files.len(),
            artifact_name
        );

        self.client
            .put(&artifact_name, &files, &output_dir, self.config.upload_options())
            .await?;

        let files = files
            .iter()
            .filter_map(|f| f.strip_prefix(&output_dir).ok().map(Path::to_path_buf))
            .collect();
        Ok(FinalPackage { artifact_name, files })
    }
}

fn checkpoint_manager(config: &RunConfig, client: &BlobClient, archiver: Arc<dyn Archiver>) -> CheckpointManager {
    CheckpointManager::new(client.clone(), archiver, config.workspace_root.clone())
        .with_subdir(config.checkpoint_subdir.clone())
        .with_exclusions(config.checkpoint_exclusions())
        .with_prefix(config.checkpoint_prefix.clone())
        .with_retention_days(config.retention_days)
        .with_settle_delay(config.settle_delay())
}

/// Regular files in `output_dir` whose names match `pattern`, sorted.
pub fn discover_packages(output_dir: &Path, pattern: &str) -> std::result::Result<Vec<PathBuf>, PublishError> {
    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&output_dir.to_string_lossy()),
        pattern
    );

    let mut files: Vec<PathBuf> = glob::glob(&full_pattern)?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("[Publish] Skipping unreadable path: {}", e);
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(PublishError::NoPackages { pattern: full_pattern });
    }
    Ok(files)
}
