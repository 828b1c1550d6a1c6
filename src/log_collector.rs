//! Run log pipeline.
//!
//! Every `log::` record and every line of build output goes through a single
//! unbounded crossbeam channel to a background thread that owns the files:
//!
//! ```text
//! log::info!() / build output
//!     |
//! [LogCollector] (non-blocking send)
//!     |
//! [disk writer thread]
//!     |-- logs/full/<ts>_full.log      every line
//!     |-- logs/parsed/<ts>_parsed.log  milestones only
//!     `-- stderr                       milestones, warnings, errors
//! ```
//!
//! `wait_for_empty` pushes a flush marker through the channel and returns once
//! the writer has reached it, so callers can guarantee the tail of a run is on
//! disk before the process exits.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Log target for high-level milestones (`log::info!(target: "parsed", ...)`).
pub const PARSED_TARGET: &str = "parsed";

enum LogMessage {
    Line(LogLine),
    /// Flush marker; the writer answers once everything before it is written
    Flush(std::sync::mpsc::Sender<()>),
}

/// Default logs directory: `./logs`
pub fn get_global_logs_path() -> Result<PathBuf, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Failed to get current working directory: {}", e))?;
    Ok(cwd.join("logs"))
}

/// One log line with metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub message: String,
    /// Milestone lines are also written to the parsed log
    pub parsed: bool,
    /// Echo to stderr (milestones, warnings and errors)
    pub echo: bool,
    /// Local time, `HH:MM:SS.mmm`
    pub timestamp: String,
    /// Build progress (0-100) when the line carries one
    pub progress: Option<u32>,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            parsed: false,
            echo: false,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
            progress: None,
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            parsed: true,
            echo: true,
            ..LogLine::new(message)
        }
    }

    pub fn with_progress(mut self, progress: u32) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn echoed(mut self) -> Self {
        self.echo = true;
        self
    }

    fn formatted(&self) -> String {
        match self.progress {
            Some(p) => format!("[{}] [{:>3}%] {}\n", self.timestamp, p, self.message),
            None => format!("[{}] {}\n", self.timestamp, self.message),
        }
    }
}

/// Disk-backed logger for one run.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    full_log_path: PathBuf,
    parsed_log_path: PathBuf,
    level: LevelFilter,
    echo_to_stderr: bool,
}

impl LogCollector {
    /// Create `log_dir/full` and `log_dir/parsed`, open this run's files and
    /// start the writer thread.
    pub fn new(log_dir: &Path) -> Result<Self, String> {
        let full_log_dir = log_dir.join("full");
        let parsed_log_dir = log_dir.join("parsed");
        std::fs::create_dir_all(&full_log_dir)
            .map_err(|e| format!("Failed to create full log dir: {}", e))?;
        std::fs::create_dir_all(&parsed_log_dir)
            .map_err(|e| format!("Failed to create parsed log dir: {}", e))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let full_log_path = full_log_dir.join(format!("{}_full.log", stamp));
        let parsed_log_path = parsed_log_dir.join(format!("{}_parsed.log", stamp));
        let mut full = open_append(&full_log_path)?;
        let mut parsed = open_append(&parsed_log_path)?;

        let (tx, rx) = unbounded::<LogMessage>();

        // Writer must not depend on a runtime: blocking workers log too.
        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let formatted = line.formatted();
                        let _ = full.write_all(formatted.as_bytes());
                        if line.parsed {
                            let _ = parsed.write_all(formatted.as_bytes());
                        }
                        if line.echo {
                            eprint!("{}", formatted);
                        }
                    }
                    LogMessage::Flush(done) => {
                        let _ = full.flush();
                        let _ = parsed.flush();
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector {
            tx,
            full_log_path,
            parsed_log_path,
            level: LevelFilter::Info,
            echo_to_stderr: true,
        })
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Stop echoing milestones and warnings to stderr.
    pub fn quiet(mut self) -> Self {
        self.echo_to_stderr = false;
        self
    }

    pub fn full_log_path(&self) -> &Path {
        &self.full_log_path
    }

    pub fn parsed_log_path(&self) -> &Path {
        &self.parsed_log_path
    }

    /// Install a clone of this collector as the global `log` backend.
    pub fn install(&self) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(self.clone()))?;
        log::set_max_level(self.level);
        Ok(())
    }

    /// Queue a line. Never blocks and never fails.
    pub fn log(&self, mut line: LogLine) {
        if !self.echo_to_stderr {
            line.echo = false;
        }
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    pub fn log_with_progress(&self, message: impl Into<String>, progress: u32) {
        self.log(LogLine::parsed(message.into()).with_progress(progress));
    }

    /// Wait until every line queued before this call has been written.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        tokio::task::spawn_blocking(move || rx.recv())
            .await
            .map_err(|e| format!("Flush waiter failed: {}", e))?
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

fn open_append(path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))
}

/// Routes `log::` records into the collector. Records on the `parsed` target
/// are milestones; warnings and errors are echoed to stderr.
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == PARSED_TARGET {
            self.log_parsed(message);
        } else if record.level() <= Level::Warn {
            self.log(LogLine::new(message).echoed());
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {}
}
