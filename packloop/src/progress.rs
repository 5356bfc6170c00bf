//! Progress evaluation between the best build so far and a candidate.
//!
//! Deterministic rules decide most cases; the [`ProgressJudge`] is consulted
//! only for two distinct build logs. The evaluator never fails: judge errors
//! degrade to [`ProgressVerdict::Stagnation`].

use tracing::{debug, info, warn};

use crate::core::log_diff::{LogComparison, compare_logs};
use crate::core::types::{BuildResult, ErrorKind, ProgressVerdict};
use crate::io::oracle::ProgressJudge;

/// Knobs for [`evaluate_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationSettings {
    /// When false, every distinct build error counts as progress.
    pub judge_enabled: bool,
    /// Window size for long log comparisons.
    pub max_lines: usize,
}

/// Judge `candidate` against `best`.
///
/// `iteration` is the 1-based ordinal of the candidate among the build errors
/// recorded this session.
pub fn evaluate_progress(
    judge: &dyn ProgressJudge,
    best: &BuildResult,
    candidate: &BuildResult,
    iteration: u32,
    settings: &EvaluationSettings,
) -> ProgressVerdict {
    if iteration == 1 || candidate.success {
        return ProgressVerdict::Progress;
    }

    let Some(candidate_error) = candidate
        .error
        .as_ref()
        .filter(|err| err.kind == ErrorKind::BuildError)
    else {
        warn!(
            kind = ?candidate.error_kind(),
            "progress evaluation asked for a non-build error"
        );
        return ProgressVerdict::Stagnation;
    };

    if best.error.as_ref() == Some(candidate_error) {
        debug!("candidate failed exactly like the best solution");
        return ProgressVerdict::Regress;
    }

    if best.source_check_only && !candidate.source_check_only {
        return ProgressVerdict::Progress;
    }
    if candidate.source_check_only {
        return ProgressVerdict::Regress;
    }

    let Some(best_error) = best
        .error
        .as_ref()
        .filter(|err| err.kind == ErrorKind::BuildError)
    else {
        // Nothing to compare against: reaching a build log at all is an improvement.
        return ProgressVerdict::Progress;
    };

    if !settings.judge_enabled {
        return ProgressVerdict::Progress;
    }

    let comparison = compare_logs(&best_error.message, &candidate_error.message, settings.max_lines);
    log_comparison(&comparison);
    match judge.judge(&comparison) {
        Ok(verdict) => {
            info!(verdict = verdict.as_str(), "judge verdict");
            verdict
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "judge failed, treating as stagnation");
            ProgressVerdict::Stagnation
        }
    }
}

fn log_comparison(comparison: &LogComparison) {
    match comparison.divergence_line() {
        Some(divergence_line) => info!(
            initial_lines = comparison.initial_lines(),
            improvement_lines = comparison.improvement_lines(),
            divergence_line,
            "comparing truncated logs"
        ),
        None => info!(
            initial_lines = comparison.initial_lines(),
            improvement_lines = comparison.improvement_lines(),
            "comparing full logs"
        ),
    }
}
