//! buildrelay CLI: one invocation of the checkpoint/resume build loop.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use buildrelay::config::loader::{default_store_root, load_or_default, save_config_to_file};
use buildrelay::log_collector::get_global_logs_path;
use buildrelay::step_output::{exit_code, write_step_outputs};
use buildrelay::{
    LocalArtifactStore, LogCollector, PlatformVariant, ProcessBuildRunner, RunConfig,
    RunOrchestrator, RunReport, RunRequest,
};

/// Run a long build across CI jobs: resume from a checkpoint, build, then
/// publish, checkpoint or fail.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A previous invocation already finished the build
    #[arg(long, action = ArgAction::Set, value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true", default_value = "false")]
    finished: bool,

    /// Restore the workspace checkpoint before building
    #[arg(long, action = ArgAction::Set, value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true", default_value = "false")]
    from_artifact: bool,

    /// Build variant: default, x86 or arm
    #[arg(long, value_name = "VARIANT", conflicts_with_all = ["x86", "arm"])]
    variant: Option<PlatformVariant>,

    /// Same as --variant x86
    #[arg(long)]
    x86: bool,

    /// Same as --variant arm
    #[arg(long)]
    arm: bool,

    /// CI run identifier, scopes diagnostic bundle names
    #[arg(long, env = "GITHUB_RUN_ID", default_value = "local")]
    run_id: String,

    /// CI job identifier, scopes diagnostic bundle names
    #[arg(long, env = "GITHUB_JOB", default_value = "0")]
    job_id: String,

    /// Build workspace (overrides workspace_root)
    #[arg(short, long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Directory of the final packages (overrides output_dir)
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Artifact store directory (overrides store_root)
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Configuration file (.json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log directory (overrides log_dir)
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Write the run report as JSON
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,

    /// Write the effective configuration to FILE and exit
    #[arg(long, value_name = "FILE")]
    init_config: Option<PathBuf>,

    /// Do not echo build output to stdout
    #[arg(short, long)]
    quiet: bool,

    /// Also log debug records
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match effective_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[Main] ERROR: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(ref path) = cli.init_config {
        return match save_config_to_file(&config, path) {
            Ok(()) => {
                eprintln!("[Main] Wrote configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("[Main] ERROR: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let log_dir = match config.log_dir.clone().map(Ok).unwrap_or_else(get_global_logs_path) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("[Main] ERROR: Failed to determine logs directory: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let log_collector = match LogCollector::new(&log_dir) {
        Ok(collector) => Arc::new(collector.with_level(level)),
        Err(e) => {
            eprintln!("[Main] ERROR: LogCollector initialization failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = log_collector.install() {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    log::info!("buildrelay {} (log: {})", buildrelay::VERSION, log_collector.full_log_path().display());
    config.log_dir = Some(log_dir);

    let result = execute(&cli, config, Arc::clone(&log_collector)).await;

    match result {
        Ok(ref report) => {
            let github_output = std::env::var_os("GITHUB_OUTPUT").map(PathBuf::from);
            if let Err(e) = write_step_outputs(report, &mut std::io::stdout(), github_output.as_deref()) {
                log::error!("[Main] Failed to write step output: {}", e);
            }
            if report.status.is_failure() {
                log::error!(target: "parsed", "[Main] Build failed: {:?}", report.status);
            }
        }
        Err(ref e) => log::error!(target: "parsed", "[Main] Run failed: {:#}", e),
    }
    let code = ExitCode::from(exit_code(&result));

    if let Err(e) = log_collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to flush logs: {}", e);
    }
    code
}

/// Config file (or defaults) with CLI overrides applied, validated.
fn effective_config(cli: &Cli) -> Result<RunConfig> {
    let (mut config, source) = load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = source {
        eprintln!("[Main] Configuration loaded from {}", path.display());
    }

    if let Some(ref workspace) = cli.workspace {
        config.workspace_root = workspace.clone();
    }
    if let Some(ref output_dir) = cli.output_dir {
        config.output_dir = output_dir.clone();
    }
    if let Some(ref store_dir) = cli.store_dir {
        config.store_root = Some(store_dir.clone());
    }
    if let Some(ref log_dir) = cli.log_dir {
        config.log_dir = Some(log_dir.clone());
    }
    if cli.quiet {
        config.echo_build_output = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn execute(cli: &Cli, mut config: RunConfig, log_collector: Arc<LogCollector>) -> Result<RunReport> {
    let variant = match cli.variant {
        Some(variant) => variant,
        None => RunRequest::from_arch_flags(cli.x86, cli.arm).map_err(anyhow::Error::msg)?,
    };
    let request = RunRequest::new(variant)
        .finished(cli.finished)
        .resume(cli.from_artifact)
        .with_ids(cli.run_id.clone(), cli.job_id.clone());
    log::info!(
        target: "parsed",
        "[Main] variant={} finished={} from_artifact={} run={} job={}",
        request.variant,
        request.finished,
        request.resume_from_checkpoint,
        request.run_id,
        request.job_id
    );

    let store_root = config.store_root.clone().unwrap_or_else(default_store_root);
    tokio::fs::create_dir_all(&store_root)
        .await
        .with_context(|| format!("Failed to create artifact store at {}", store_root.display()))?;
    log::info!("[Main] Artifact store: {}", store_root.display());
    config.store_root = Some(store_root.clone());
    let store = Arc::new(LocalArtifactStore::new(store_root));

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::warn!(target: "parsed", "[Main] Interrupt received, cancelling build");
        let _ = cancel_tx.send(true);
    });

    let runner = Arc::new(
        ProcessBuildRunner::new()
            .with_log_collector(log_collector)
            .echo_output(config.echo_build_output),
    );
    let orchestrator = RunOrchestrator::new(config, store, runner, cancel_rx);
    let report = orchestrator.run(&request).await?;

    if let Some(ref path) = cli.summary {
        write_summary(path, &report)?;
    }
    Ok(report)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("[Main] SIGTERM handler unavailable: {}", e),
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn write_summary(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write summary {}", path.display()))?;
    Ok(())
}
