//! Run phase tracking.
//!
//! - `RunPhase`: discrete phases of one invocation
//! - `RunState`: current phase plus the timeline of transitions
//!
//! ```text
//! Start -> Resuming -> Building -> Succeeded     -> Done
//!   |                     ^    -> Failed        -> Done
//!   |---------------------|    -> Checkpointing -> Done
//!   `-> Done (already finished)
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Start,
    /// Restoring the workspace checkpoint
    Resuming,
    /// Build subprocess running
    Building,
    /// Build exited 0, publishing output
    Succeeded,
    /// Build exited 1, collecting diagnostics
    Failed,
    /// Build interrupted, saving the workspace
    Checkpointing,
    Done,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Start => "start",
            RunPhase::Resuming => "resuming",
            RunPhase::Building => "building",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
            RunPhase::Checkpointing => "checkpointing",
            RunPhase::Done => "done",
        }
    }

    /// All valid phase transitions FROM this phase.
    pub fn valid_next_phases(&self) -> &'static [RunPhase] {
        match self {
            RunPhase::Start => &[RunPhase::Resuming, RunPhase::Building, RunPhase::Done],
            RunPhase::Resuming => &[RunPhase::Building],
            RunPhase::Building => &[RunPhase::Succeeded, RunPhase::Failed, RunPhase::Checkpointing],
            RunPhase::Succeeded | RunPhase::Failed | RunPhase::Checkpointing => &[RunPhase::Done],
            RunPhase::Done => &[],
        }
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        self.valid_next_phases().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        *self == RunPhase::Done
    }
}

/// Phase of a run and when each phase was entered.
#[derive(Debug, Clone)]
pub struct RunState {
    phase: RunPhase,
    started: Instant,
    history: Vec<(RunPhase, Duration)>,
}

impl RunState {
    pub fn new() -> Self {
        RunState {
            phase: RunPhase::Start,
            started: Instant::now(),
            history: vec![(RunPhase::Start, Duration::ZERO)],
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Phases visited so far, in order
    pub fn phases(&self) -> Vec<RunPhase> {
        self.history.iter().map(|(phase, _)| *phase).collect()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `next`, rejecting transitions the phase graph does not allow.
    pub fn transition_to(&mut self, next: RunPhase) -> Result<(), RunError> {
        if !self.phase.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }
        log::info!("[State] {} -> {}", self.phase.as_str(), next.as_str());
        self.phase = next;
        self.history.push((next, self.started.elapsed()));
        Ok(())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
