//! Pure bookkeeping for the packaging loop state machine.
//!
//! The controller feeds every rebuild outcome through [`LoopCounters`], which
//! decides what happens to the candidate and when the loop must stop. Nothing
//! here touches the working tree.

use serde::{Deserialize, Serialize};

use crate::core::types::{ErrorKind, ProgressVerdict};

/// Ceilings that bound the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iterations: u32,
    pub max_consecutive_rebuilds_without_progress: u32,
    pub max_consecutive_non_build_errors: u32,
}

/// What to do with the candidate after a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateAction {
    /// The candidate becomes the new best solution.
    Promote,
    /// Keep iterating on the candidate without promoting it.
    Keep,
    /// Discard the candidate and restore the best solution.
    Rollback,
}

/// Why iterating stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The iteration ceiling was reached.
    IterationLimit,
    /// Too many consecutive rebuilds made no progress.
    StagnationLimit,
    /// A cancellation request was honored between iterations.
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::IterationLimit => "iteration limit reached",
            StopReason::StagnationLimit => "too many rebuilds without progress",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// How the edit for an iteration was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    /// The invalid hash literal was swapped for a placeholder without asking the oracle.
    MechanicalHash,
    Hash,
    General,
}

/// What one iteration did to the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationAction {
    /// The edit left the code unchanged; nothing was rebuilt.
    Unchanged,
    /// The rebuilt candidate is a full success.
    Succeeded,
    Promoted,
    Kept,
    RolledBack,
}

/// Read-only summary of a finished iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// 1-based iteration number.
    pub iteration: u32,
    /// Error the edit was asked to fix.
    pub error_kind: ErrorKind,
    pub fix: FixKind,
    pub action: IterationAction,
    /// Error of the rebuilt candidate, if it was rebuilt and failed.
    pub result_kind: Option<ErrorKind>,
    pub verdict: Option<ProgressVerdict>,
    pub counters: LoopCounters,
}

/// Counters carried across iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopCounters {
    /// Iterations consumed so far (one oracle call each).
    pub iteration: u32,
    pub consecutive_rebuilds_without_progress: u32,
    pub consecutive_non_build_errors: u32,
    /// Build-class errors recorded this session, including the initial build.
    pub build_errors_recorded: u32,
    /// The last verdict was [`ProgressVerdict::BrokenLogOutput`] and has not been resolved.
    pub broken_log_output: bool,
}

impl LoopCounters {
    /// The next iteration may start only if no ceiling has been hit.
    pub fn stop_reason(&self, limits: &LoopLimits) -> Option<StopReason> {
        if self.iteration >= limits.max_iterations {
            return Some(StopReason::IterationLimit);
        }
        if self.consecutive_rebuilds_without_progress
            >= limits.max_consecutive_rebuilds_without_progress
        {
            return Some(StopReason::StagnationLimit);
        }
        None
    }

    pub fn finish_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Record a build-class error and return its 1-based ordinal for the evaluator.
    pub fn record_build_error(&mut self) -> u32 {
        self.build_errors_recorded += 1;
        self.build_errors_recorded
    }

    /// Apply the progress verdict for a build-class error.
    pub fn apply_verdict(&mut self, verdict: ProgressVerdict) -> CandidateAction {
        self.consecutive_non_build_errors = 0;
        match verdict {
            ProgressVerdict::Progress => {
                self.reset_after_progress();
                CandidateAction::Promote
            }
            ProgressVerdict::BrokenLogOutput => {
                self.broken_log_output = true;
                CandidateAction::Keep
            }
            ProgressVerdict::Stagnation if self.broken_log_output => {
                // A readable log after a broken one counts as progress.
                self.reset_after_progress();
                CandidateAction::Promote
            }
            ProgressVerdict::Stagnation | ProgressVerdict::Regress => {
                self.consecutive_rebuilds_without_progress += 1;
                CandidateAction::Rollback
            }
        }
    }

    /// Apply a non-build-class error (eval, hash, dependency).
    pub fn apply_non_build_error(&mut self, limits: &LoopLimits) -> CandidateAction {
        self.consecutive_non_build_errors += 1;
        if self.consecutive_non_build_errors >= limits.max_consecutive_non_build_errors {
            self.consecutive_non_build_errors = 0;
            return CandidateAction::Rollback;
        }
        CandidateAction::Keep
    }

    fn reset_after_progress(&mut self) {
        self.consecutive_rebuilds_without_progress = 0;
        self.consecutive_non_build_errors = 0;
        self.broken_log_output = false;
    }
}
