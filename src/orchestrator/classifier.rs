//! Exit code classification.
//!
//! The build tool reserves 0 (done) and 1 (patch or compile defect). Every
//! other code, including signal-derived ones, is an external interruption and
//! therefore resumable.

use crate::models::BuildOutcome;
use std::process::ExitStatus;

/// Exit code reported by the build tool for a deterministic failure.
pub const BUILD_FAILURE_EXIT_CODE: i32 = 1;

/// Map a build exit code to its outcome. Pure and total.
pub fn classify(exit_code: i32) -> BuildOutcome {
    match exit_code {
        0 => BuildOutcome::Success,
        BUILD_FAILURE_EXIT_CODE => BuildOutcome::BuildOrPatchFailure { exit_code },
        _ => BuildOutcome::TimeoutOrCancelled { exit_code },
    }
}

/// Exit code of a finished process, `128 + signal` when it was killed.
///
/// Returns `None` only when the platform reports neither.
pub fn exit_code_from_status(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}
