//! Build execution: spawning the build tool, streaming its output, cancellation.
//!
//! Integrates with the logging pipeline via LogCollector for:
//! - Full build output persistence
//! - Progress milestones parsed from `[X/Y]` / `[N%]` markers
//!
//! A non-zero exit code is never an error here. It is returned as-is for the
//! classifier; only a failure to spawn or supervise the process is a
//! `BuildError`.

use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::BuildError;
use crate::log_collector::LogCollector;
use crate::models::PlatformVariant;
use crate::orchestrator::classifier::exit_code_from_status;

/// Exit code reported for a build cancelled before it started (`128 + SIGTERM`).
pub const CANCELLED_EXIT_CODE: i32 = 143;

/// How long output is still read after the build was killed. Anything that
/// escaped the process group and keeps the pipes open is abandoned after it.
pub const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Fully resolved build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl BuildCommand {
    /// `program args... <variant flags...>`, run in `working_dir`.
    pub fn for_variant(
        program: impl Into<String>,
        args: &[String],
        variant: PlatformVariant,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut args = args.to_vec();
        args.extend(variant.build_flags().iter().map(|f| f.to_string()));
        BuildCommand {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a build process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildExit {
    pub exit_code: i32,
    /// The cancellation token fired while the build was running
    pub cancelled: bool,
    pub duration: Duration,
}

/// Runs the build tool. The seam tests replace with a scripted runner.
pub trait BuildRunner: Send + Sync {
    fn run(
        &self,
        command: BuildCommand,
        cancel_rx: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<BuildExit, BuildError>>;
}

static NINJA_PROGRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*(\d+)/(\d+)\]").unwrap());
static PERCENT_PROGRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*(\d+)%\]").unwrap());

/// Parses `[X/Y]` (ninja) or `[N%]` progress markers out of a build line.
pub fn parse_build_progress(line: &str) -> Option<u32> {
    if let Some(caps) = NINJA_PROGRESS.captures(line) {
        if let (Ok(current), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
            if total > 0 {
                return Some((current.saturating_mul(100) / total).min(100) as u32);
            }
        }
    }

    if let Some(caps) = PERCENT_PROGRESS.captures(line) {
        if let Ok(progress) = caps[1].parse::<u32>() {
            return Some(progress.min(100));
        }
    }

    None
}

/// Turns a stream of progress values into milestones, one per `step` percent.
#[derive(Debug)]
pub struct ProgressTracker {
    step: u32,
    last_milestone: Option<u32>,
}

impl ProgressTracker {
    pub fn new(step: u32) -> Self {
        ProgressTracker {
            step: step.max(1),
            last_milestone: None,
        }
    }

    /// Returns the milestone reached by `progress`, if it is a new one.
    pub fn observe(&mut self, progress: u32) -> Option<u32> {
        let milestone = progress.min(100) / self.step * self.step;
        match self.last_milestone {
            Some(last) if milestone <= last => None,
            _ => {
                self.last_milestone = Some(milestone);
                Some(milestone)
            }
        }
    }
}

/// Spawn `command`, stream its output and wait for it to exit.
///
/// Each stdout/stderr line goes to `output_callback` together with any
/// progress parsed from it, and to `log_collector` when one is given. When
/// `cancel_rx` flips to `true` the process group is killed and output is
/// drained for at most [`CANCEL_DRAIN_TIMEOUT`]; the signal-derived exit code
/// is returned with `cancelled` set.
pub async fn run_build_process<F>(
    command: &BuildCommand,
    mut output_callback: F,
    mut cancel_rx: watch::Receiver<bool>,
    log_collector: Option<Arc<LogCollector>>,
) -> Result<BuildExit, BuildError>
where
    F: FnMut(String, Option<u32>) + Send,
{
    let started = Instant::now();
    if *cancel_rx.borrow() {
        log::warn!("[Build] Cancelled before start, not spawning {}", command.program);
        return Ok(BuildExit {
            exit_code: CANCELLED_EXIT_CODE,
            cancelled: true,
            duration: started.elapsed(),
        });
    }

    log::info!(target: "parsed", "[Build] Starting: {} (in {})", command.display(), command.working_dir.display());

    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .current_dir(&command.working_dir)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);

    let mut child = process.spawn().map_err(|source| BuildError::SpawnFailed {
        program: command.program.clone(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BuildError::NoExitStatus("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BuildError::NoExitStatus("stderr was not captured".to_string()))?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_closed = false;
    let mut stderr_closed = false;
    let mut cancel_closed = false;
    let mut cancelled = false;
    let mut tracker = ProgressTracker::new(5);
    let drain_deadline = tokio::time::sleep(CANCEL_DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);

    let mut handle_line = |line: String, output_callback: &mut F| {
        let progress = parse_build_progress(&line);
        let milestone = progress.and_then(|p| tracker.observe(p));
        match (log_collector.as_ref(), milestone) {
            (Some(collector), Some(milestone)) => collector.log_with_progress(&line, milestone),
            (Some(collector), None) => collector.log_str(&line),
            (None, Some(milestone)) => log::info!(target: "parsed", "[Build] Progress {}%: {}", milestone, line),
            (None, None) => {}
        }
        output_callback(line, progress);
    };

    while !(stdout_closed && stderr_closed) {
        tokio::select! {
            line_result = stdout_lines.next_line(), if !stdout_closed => {
                match line_result {
                    Ok(Some(line)) => handle_line(line, &mut output_callback),
                    Ok(None) => stdout_closed = true,
                    Err(e) => {
                        log::warn!("[Build] stdout read error: {}", e);
                        stdout_closed = true;
                    }
                }
            }
            line_result = stderr_lines.next_line(), if !stderr_closed => {
                match line_result {
                    Ok(Some(line)) => handle_line(format!("[STDERR] {}", line), &mut output_callback),
                    Ok(None) => stderr_closed = true,
                    Err(e) => {
                        log::warn!("[Build] stderr read error: {}", e);
                        stderr_closed = true;
                    }
                }
            }
            changed = cancel_rx.changed(), if !cancel_closed && !cancelled => {
                if changed.is_err() {
                    cancel_closed = true;
                } else if *cancel_rx.borrow() {
                    log::warn!(target: "parsed", "[Build] Cancellation requested, terminating build");
                    terminate(&mut child);
                    cancelled = true;
                    drain_deadline.as_mut().reset(tokio::time::Instant::now() + CANCEL_DRAIN_TIMEOUT);
                }
            }
            _ = &mut drain_deadline, if cancelled => {
                log::warn!(
                    "[Build] Output still open {}s after cancellation, no longer reading it",
                    CANCEL_DRAIN_TIMEOUT.as_secs()
                );
                break;
            }
        }
    }

    let status = child.wait().await?;
    let exit_code = exit_code_from_status(&status)
        .ok_or_else(|| BuildError::NoExitStatus(status.to_string()))?;
    let duration = started.elapsed();
    log::info!(
        target: "parsed",
        "[Build] Exited with code {} after {}s{}",
        exit_code,
        duration.as_secs(),
        if cancelled { " (cancelled)" } else { "" }
    );

    Ok(BuildExit {
        exit_code,
        cancelled,
        duration,
    })
}

/// Kill the build's whole process group, then the child itself.
///
/// The child leads its own group (`process_group(0)`), so the group id is its pid.
fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                log::warn!("[Build] Failed to kill process group {}: {}", pid, e);
            }
        }
    }
    if let Err(e) = child.start_kill() {
        log::warn!("[Build] Failed to kill build process: {}", e);
    }
}

/// Runs the build as a real subprocess.
#[derive(Clone, Default)]
pub struct ProcessBuildRunner {
    log_collector: Option<Arc<LogCollector>>,
    echo: bool,
}

impl ProcessBuildRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_collector(mut self, collector: Arc<LogCollector>) -> Self {
        self.log_collector = Some(collector);
        self
    }

    /// Print build output to stdout as it arrives.
    pub fn echo_output(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

impl BuildRunner for ProcessBuildRunner {
    fn run(
        &self,
        command: BuildCommand,
        cancel_rx: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<BuildExit, BuildError>> {
        let echo = self.echo;
        let collector = self.log_collector.clone();
        async move {
            run_build_process(
                &command,
                |line, _progress| {
                    if echo {
                        println!("{}", line);
                    }
                },
                cancel_rx,
                collector,
            )
            .await
        }
        .boxed()
    }
}

type WorkspaceEffect = Arc<dyn Fn(&Path) + Send + Sync>;

/// Build runner that never spawns anything: it records each invocation,
/// applies an optional effect to the working directory and returns a fixed
/// exit code. With `until_cancelled` it instead waits for the cancellation
/// token and reports a killed process.
#[derive(Clone)]
pub struct ScriptedBuildRunner {
    exit_code: i32,
    until_cancelled: bool,
    effect: Option<WorkspaceEffect>,
    invocations: Arc<Mutex<Vec<BuildCommand>>>,
}

impl ScriptedBuildRunner {
    pub fn exiting_with(exit_code: i32) -> Self {
        ScriptedBuildRunner {
            exit_code,
            until_cancelled: false,
            effect: None,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Block until cancelled, then exit as if killed by SIGKILL.
    pub fn until_cancelled() -> Self {
        ScriptedBuildRunner {
            until_cancelled: true,
            ..Self::exiting_with(137)
        }
    }

    pub fn with_effect(mut self, effect: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.effect = Some(Arc::new(effect));
        self
    }

    pub fn invocations(&self) -> Vec<BuildCommand> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl BuildRunner for ScriptedBuildRunner {
    fn run(
        &self,
        command: BuildCommand,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<BuildExit, BuildError>> {
        async move {
            if let Ok(mut calls) = self.invocations.lock() {
                calls.push(command.clone());
            }
            if let Some(ref effect) = self.effect {
                effect(&command.working_dir);
            }
            let mut cancelled = false;
            if self.until_cancelled {
                while !*cancel_rx.borrow_and_update() {
                    if cancel_rx.changed().await.is_err() {
                        break;
                    }
                }
                cancelled = *cancel_rx.borrow();
            }
            Ok(BuildExit {
                exit_code: self.exit_code,
                cancelled,
                duration: Duration::ZERO,
            })
        }
        .boxed()
    }
}
