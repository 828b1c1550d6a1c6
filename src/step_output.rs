//! What an invocation hands back to the CI runner: the `finished` step
//! output and the process exit code.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use crate::models::RunReport;

pub const FINISHED_KEY: &str = "finished";

/// Writes `finished=<bool>` to `stdout` and appends it to `github_output`
/// when given. A failed build produces no output at all.
pub fn write_step_outputs<W: Write>(
    report: &RunReport,
    stdout: &mut W,
    github_output: Option<&Path>,
) -> io::Result<()> {
    let finished = match report.finished() {
        Some(finished) => finished,
        None => return Ok(()),
    };
    let line = format!("{}={}", FINISHED_KEY, finished);

    writeln!(stdout, "{}", line)?;
    if let Some(path) = github_output {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

/// 0 unless the build failed or the run itself errored.
pub fn exit_code<E>(result: &Result<RunReport, E>) -> u8 {
    match result {
        Ok(report) if !report.status.is_failure() => 0,
        _ => 1,
    }
}
