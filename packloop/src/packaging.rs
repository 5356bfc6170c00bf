//! The packaging loop: fix, rebuild, classify, evaluate, keep or roll back.
//!
//! One iteration is one oracle request followed by at most one rebuild. All
//! bookkeeping lives in [`LoopCounters`]; this module only sequences the I/O
//! and moves the working tree through the [`SolutionStore`].
//!
//! Once the package builds, a bounded refinement phase asks the oracle for
//! improvements and runs the optional formatter. Only edits that still build
//! are kept; anything else is rolled back to the last building solution.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::replace_invalid_hash;
use crate::core::decision::{
    CandidateAction, FixKind, IterationAction, IterationReport, LoopCounters, LoopLimits,
    StopReason,
};
use crate::core::types::{BuildError, BuildResult, ErrorKind, ProgressVerdict};
use crate::io::build::{BuildTool, build_with_source_check};
use crate::io::config::PackloopConfig;
use crate::io::format::CodeFormatter;
use crate::io::git::VersionControl;
use crate::io::iteration_log::{IterationWriteRequest, write_iteration};
use crate::io::oracle::{CodeFixOracle, FixContext, ProgressJudge, RefineContext};
use crate::io::solution_store::{SolutionId, SolutionStore};
use crate::progress::{EvaluationSettings, evaluate_progress};

/// Cooperative cancellation, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the loop needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub limits: LoopLimits,
    pub evaluation: EvaluationSettings,
    pub error_page_lines: usize,
    pub project_summary: Option<String>,
    /// Where per-iteration artifacts go; `None` disables them.
    pub iterations_dir: Option<PathBuf>,
    /// Refinement requests made after the package first builds.
    pub refinement_rounds: u32,
}

impl LoopSettings {
    pub fn from_config(cfg: &PackloopConfig) -> Self {
        Self {
            limits: cfg.limits(),
            evaluation: EvaluationSettings {
                judge_enabled: cfg.progress_evaluation_enabled,
                max_lines: cfg.log_comparison_max_lines,
            },
            error_page_lines: cfg.error_page_lines,
            project_summary: None,
            iterations_dir: None,
            refinement_rounds: cfg.refinement_rounds,
        }
    }
}

/// Why the loop gave up, with the best code it reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub stop: StopReason,
    /// Code of the best solution, which is also what the working tree holds.
    pub best_code: String,
    /// Error of the last candidate that was built.
    pub last_error: Option<BuildError>,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_error {
            Some(error) => write!(f, "{} (last error: {})", self.stop.as_str(), error.kind.as_str()),
            None => write!(f, "{}", self.stop.as_str()),
        }
    }
}

/// Terminal state of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Succeeded { code: String },
    Failed(FailureReason),
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Iterations consumed (oracle fix requests made).
    pub iterations: u32,
    /// Refinement and formatting edits kept after the package built.
    pub refinements: u32,
    pub best: SolutionId,
    pub counters: LoopCounters,
    pub stop: LoopStop,
}

impl LoopOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.stop, LoopStop::Succeeded { .. })
    }

    /// The final code, or why the loop gave up.
    pub fn into_result(self) -> Result<String, FailureReason> {
        match self.stop {
            LoopStop::Succeeded { code } => Ok(code),
            LoopStop::Failed(reason) => Err(reason),
        }
    }
}

/// The build, classify, repair, evaluate loop over one working tree.
pub struct PackagingLoop<'a, V: VersionControl, B, O, J> {
    store: &'a mut SolutionStore<V>,
    builder: &'a B,
    oracle: &'a O,
    judge: &'a J,
    settings: &'a LoopSettings,
    formatter: Option<&'a dyn CodeFormatter>,
    cancel: CancelToken,
}

impl<'a, V, B, O, J> PackagingLoop<'a, V, B, O, J>
where
    V: VersionControl,
    B: BuildTool,
    O: CodeFixOracle,
    J: ProgressJudge,
{
    pub fn new(
        store: &'a mut SolutionStore<V>,
        builder: &'a B,
        oracle: &'a O,
        judge: &'a J,
        settings: &'a LoopSettings,
    ) -> Self {
        Self {
            store,
            builder,
            oracle,
            judge,
            settings,
            formatter: None,
            cancel: CancelToken::new(),
        }
    }

    /// Format the final code with `formatter`, keeping the result only if it builds.
    pub fn with_formatter(mut self, formatter: &'a dyn CodeFormatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build `initial_code`, then iterate until success or a ceiling is hit.
    ///
    /// `Err` means the session could not run at all (build tool missing,
    /// working tree unwritable); every build or oracle failure is handled
    /// inside the loop.
    #[instrument(skip_all)]
    pub fn run<F: FnMut(&IterationReport)>(
        mut self,
        initial_code: &str,
        mut on_iteration: F,
    ) -> Result<LoopOutcome> {
        let limits = self.settings.limits;
        let mut counters = LoopCounters::default();

        let initial = self.build_and_record(initial_code, "packloop: initial build")?;
        let mut best = initial;
        let mut candidate = initial;
        let initial_result = self.store.expect_solution(initial)?.result.clone();
        if initial_result.is_terminal_success() {
            info!("initial code already builds");
            return self.succeed(best, counters);
        }
        if initial_result.error_kind() == Some(ErrorKind::BuildError) {
            counters.record_build_error();
        }
        let mut last_error = initial_result.error;

        let stop = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(reason) = counters.stop_reason(&limits) {
                break reason;
            }

            let current = self.store.expect_solution(candidate)?.clone();
            let error = current
                .result
                .error
                .clone()
                .ok_or_else(|| anyhow!("candidate {} failed without an error", current.error_index))?;
            let iteration = counters.iteration + 1;
            info!(iteration, kind = error.kind.as_str(), "starting iteration");

            let (fix, edited) = self.request_fix(&current.code, &error, &counters);
            let Some(code) = edited.filter(|code| *code != current.code) else {
                info!(iteration, "edit left the code unchanged, skipping rebuild");
                counters.finish_iteration();
                let report = IterationReport {
                    iteration,
                    error_kind: error.kind,
                    fix,
                    action: IterationAction::Unchanged,
                    result_kind: None,
                    verdict: None,
                    counters: counters.clone(),
                };
                self.log_iteration(&report, &current.code, None)?;
                on_iteration(&report);
                continue;
            };

            candidate = self.build_and_record(&code, &format!("packloop: iteration {iteration}"))?;
            let result = self.store.expect_solution(candidate)?.result.clone();
            last_error.clone_from(&result.error);

            let (action, verdict) = if result.is_terminal_success() {
                (IterationAction::Succeeded, None)
            } else if result.error_kind() == Some(ErrorKind::BuildError) {
                let ordinal = counters.record_build_error();
                let best_result = self.store.expect_solution(best)?.result.clone();
                let verdict = evaluate_progress(
                    self.judge,
                    &best_result,
                    &result,
                    ordinal,
                    &self.settings.evaluation,
                );
                let decision = counters.apply_verdict(verdict);
                let action = self.apply_decision(decision, &mut best, &mut candidate)?;
                (action, Some(verdict))
            } else {
                let decision = counters.apply_non_build_error(&limits);
                let action = self.apply_decision(decision, &mut best, &mut candidate)?;
                (action, None)
            };
            counters.finish_iteration();

            let report = IterationReport {
                iteration,
                error_kind: error.kind,
                fix,
                action,
                result_kind: result.error_kind(),
                verdict,
                counters: counters.clone(),
            };
            info!(
                iteration,
                action = ?report.action,
                verdict = report.verdict.map(ProgressVerdict::as_str),
                "finished iteration"
            );
            self.log_iteration(&report, &code, result.error.as_ref())?;
            on_iteration(&report);

            if action == IterationAction::Succeeded {
                return self.succeed(candidate, counters);
            }
        };

        self.fail(
            FailureReason {
                stop,
                best_code: String::new(),
                last_error,
            },
            best,
            counters,
        )
    }

    /// Ask for an edit. `None` means no usable edit was produced.
    fn request_fix(
        &self,
        code: &str,
        error: &BuildError,
        counters: &LoopCounters,
    ) -> (FixKind, Option<String>) {
        let (fix, answer) = match error.kind {
            ErrorKind::InvalidHash => {
                if let Some(fixed) = replace_invalid_hash(code, &error.message) {
                    info!("replaced invalid hash literal with a placeholder");
                    return (FixKind::MechanicalHash, Some(fixed));
                }
                (FixKind::Hash, self.oracle.fix_hash(code, error))
            }
            ErrorKind::HashMismatch => (FixKind::Hash, self.oracle.fix_hash(code, error)),
            ErrorKind::EvalError | ErrorKind::BuildError | ErrorKind::DependencyBuildError => {
                let context = FixContext {
                    first_build_error: error.kind == ErrorKind::BuildError
                        && counters.build_errors_recorded == 1,
                    broken_log_output: counters.broken_log_output,
                    project_summary: self.settings.project_summary.clone(),
                    page_lines: self.settings.error_page_lines,
                };
                (
                    FixKind::General,
                    self.oracle.fix_general(code, error, &context),
                )
            }
        };
        match answer {
            Ok(code) => (fix, Some(code)),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "oracle failed, treating as no edit");
                (fix, None)
            }
        }
    }

    /// Improve a building solution; returns the new best and how many edits were kept.
    #[instrument(skip_all, fields(rounds = self.settings.refinement_rounds))]
    fn refine(&mut self, mut best: SolutionId) -> Result<(SolutionId, u32)> {
        let max_rounds = self.settings.refinement_rounds;
        let mut kept = 0;
        for round in 1..=max_rounds {
            if self.cancel.is_cancelled() {
                return Ok((best, kept));
            }
            let code = self.store.expect_solution(best)?.code.clone();
            let context = RefineContext {
                round,
                max_rounds,
                project_summary: self.settings.project_summary.clone(),
            };
            let refined = match self.oracle.refine(&code, &context) {
                Ok(refined) => refined,
                Err(err) => {
                    warn!(round, err = %format!("{err:#}"), "refinement request failed");
                    continue;
                }
            };
            if refined == code {
                info!(round, "refinement left the code unchanged");
                continue;
            }
            let message = format!("packloop: refinement {round}");
            if let Some(id) = self.keep_if_builds(best, &refined, &message)? {
                best = id;
                kept += 1;
            }
        }

        if let Some(formatter) = self.formatter {
            if self.cancel.is_cancelled() {
                return Ok((best, kept));
            }
            let code = self.store.expect_solution(best)?.code.clone();
            match formatter.format(&code) {
                Ok(formatted) if formatted != code => {
                    let kept_id = self.keep_if_builds(best, &formatted, "packloop: format")?;
                    if let Some(id) = kept_id {
                        best = id;
                        kept += 1;
                    }
                }
                Ok(_) => debug!("code already formatted"),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "formatter failed, keeping code as is");
                }
            }
        }
        Ok((best, kept))
    }

    /// Build `code`; keep it if it still builds, otherwise restore `best`.
    fn keep_if_builds(
        &mut self,
        best: SolutionId,
        code: &str,
        message: &str,
    ) -> Result<Option<SolutionId>> {
        let candidate = self.build_and_record(code, message)?;
        let result = &self.store.expect_solution(candidate)?.result;
        if result.is_terminal_success() {
            info!("edit still builds, keeping it");
            return Ok(Some(candidate));
        }
        warn!(
            kind = result.error_kind().map(ErrorKind::as_str),
            "edit broke the build, restoring the last building solution"
        );
        self.store.rollback(best)?;
        Ok(None)
    }

    fn build_and_record(&mut self, code: &str, message: &str) -> Result<SolutionId> {
        let commit_id = self.store.apply(code, message)?;
        let result: BuildResult = build_with_source_check(self.builder)?;
        Ok(self.store.record(code.to_string(), commit_id, result))
    }

    fn apply_decision(
        &mut self,
        decision: CandidateAction,
        best: &mut SolutionId,
        candidate: &mut SolutionId,
    ) -> Result<IterationAction> {
        match decision {
            CandidateAction::Promote => {
                *best = *candidate;
                Ok(IterationAction::Promoted)
            }
            CandidateAction::Keep => Ok(IterationAction::Kept),
            CandidateAction::Rollback => {
                self.store.rollback(*best)?;
                *candidate = *best;
                Ok(IterationAction::RolledBack)
            }
        }
    }

    fn log_iteration(
        &self,
        report: &IterationReport,
        code: &str,
        error: Option<&BuildError>,
    ) -> Result<()> {
        let Some(iterations_dir) = &self.settings.iterations_dir else {
            return Ok(());
        };
        write_iteration(&IterationWriteRequest {
            iterations_dir,
            report,
            code,
            error,
        })?;
        Ok(())
    }

    fn succeed(mut self, best: SolutionId, counters: LoopCounters) -> Result<LoopOutcome> {
        info!(iterations = counters.iteration, "package builds");
        let (best, refinements) = self.refine(best)?;
        let code = self.store.expect_solution(best)?.code.clone();
        Ok(LoopOutcome {
            iterations: counters.iteration,
            refinements,
            best,
            counters,
            stop: LoopStop::Succeeded { code },
        })
    }

    /// Restore the best solution and fill in its code.
    fn fail(
        self,
        mut reason: FailureReason,
        best: SolutionId,
        counters: LoopCounters,
    ) -> Result<LoopOutcome> {
        self.store.rollback(best)?;
        reason.best_code = self.store.expect_solution(best)?.code.clone();
        warn!(
            reason = reason.stop.as_str(),
            iterations = counters.iteration,
            "giving up, working tree holds the best solution"
        );
        Ok(LoopOutcome {
            iterations: counters.iteration,
            refinements: 0,
            best,
            counters,
            stop: LoopStop::Failed(reason),
        })
    }
}
