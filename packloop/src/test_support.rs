//! Test-only fakes for the build tool, the oracle, the judge and the formatter, plus a scratch working tree.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::log_diff::LogComparison;
use crate::core::types::{BuildError, ErrorKind, ProgressVerdict};
use crate::io::build::{BuildTarget, BuildTool, ToolOutput};
use crate::io::config::PackloopConfig;
use crate::io::git::Git;
use crate::io::init::{InitOptions, PackloopPaths, init_workspace};
use crate::io::format::CodeFormatter;
use crate::io::oracle::{CodeFixOracle, FixContext, ProgressJudge, RefineContext};
use crate::io::solution_store::SolutionStore;

const SOURCE_PLAN: &str = "/nix/store/scripted-source.drv";
const PACKAGE_PLAN: &str = "/nix/store/scripted-package.drv";

/// Outcome of one scripted build (source check plus full build).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedBuild {
    Success,
    /// The source check fails to resolve with this stderr.
    SourceFailure(String),
    /// The full package fails to resolve with this stderr.
    EvalFailure(String),
    /// The full build fails; `log` is what `fetch_log` returns, if anything.
    BuildFailure { stderr: String, log: Option<String> },
}

impl ScriptedBuild {
    /// A package build failure whose log is `log`.
    pub fn build_error(log: impl Into<String>) -> Self {
        ScriptedBuild::BuildFailure {
            stderr: "error: builder for '/nix/store/scripted-package.drv' failed".to_string(),
            log: Some(log.into()),
        }
    }

    /// A build that fails on stderr alone, without a fetchable log.
    pub fn stderr_only(stderr: impl Into<String>) -> Self {
        ScriptedBuild::BuildFailure {
            stderr: stderr.into(),
            log: None,
        }
    }
}

/// [`BuildTool`] that plays back one [`ScriptedBuild`] per source-checked build.
///
/// Each build pops the next outcome when its source check resolves. Running
/// out of outcomes is an error, which aborts the loop under test.
#[derive(Debug, Default)]
pub struct ScriptedBuildTool {
    outcomes: RefCell<VecDeque<ScriptedBuild>>,
    current: RefCell<Option<ScriptedBuild>>,
    builds: Cell<usize>,
}

impl ScriptedBuildTool {
    pub fn new(outcomes: impl IntoIterator<Item = ScriptedBuild>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of builds started so far.
    pub fn builds(&self) -> usize {
        self.builds.get()
    }

    fn current(&self) -> Result<ScriptedBuild> {
        self.current
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("package step before source check"))
    }
}

impl BuildTool for ScriptedBuildTool {
    fn resolve_plan(&self, target: BuildTarget) -> Result<ToolOutput> {
        match target {
            BuildTarget::Source => {
                let outcome = self
                    .outcomes
                    .borrow_mut()
                    .pop_front()
                    .ok_or_else(|| anyhow!("no scripted build left"))?;
                self.builds.set(self.builds.get() + 1);
                *self.current.borrow_mut() = Some(outcome.clone());
                Ok(match outcome {
                    ScriptedBuild::SourceFailure(stderr) => ToolOutput::failed(stderr),
                    _ => ToolOutput::ok(SOURCE_PLAN),
                })
            }
            BuildTarget::Package => Ok(match self.current()? {
                ScriptedBuild::EvalFailure(stderr) => ToolOutput::failed(stderr),
                _ => ToolOutput::ok(PACKAGE_PLAN),
            }),
        }
    }

    fn execute_build(&self, plan: &str) -> Result<ToolOutput> {
        if plan == SOURCE_PLAN {
            return Ok(ToolOutput::ok(""));
        }
        Ok(match self.current()? {
            ScriptedBuild::BuildFailure { stderr, .. } => ToolOutput::failed(stderr),
            _ => ToolOutput::ok(""),
        })
    }

    fn fetch_log(&self, _plan: &str) -> Result<ToolOutput> {
        Ok(match self.current()? {
            ScriptedBuild::BuildFailure { log: Some(log), .. } => ToolOutput::ok(log),
            _ => ToolOutput::failed("error: build log not available"),
        })
    }
}

/// One scripted oracle answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleAnswer {
    Code(String),
    /// Return the code unchanged.
    Unchanged,
    /// Fail the request with this message.
    Fail(String),
}

/// A request the scripted oracle received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleCall {
    General {
        code: String,
        kind: ErrorKind,
        context: FixContext,
    },
    Hash {
        code: String,
        kind: ErrorKind,
    },
}

/// [`CodeFixOracle`] that replays queued answers and records every request.
///
/// Once the queue is empty it appends a numbered comment to the code, so
/// every further request yields a distinct edit. Refinement requests replay
/// their own queue and leave the code unchanged once it runs dry.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    answers: RefCell<VecDeque<OracleAnswer>>,
    calls: RefCell<Vec<OracleCall>>,
    refinements: RefCell<VecDeque<OracleAnswer>>,
    refine_calls: RefCell<Vec<(String, RefineContext)>>,
}

impl ScriptedOracle {
    pub fn new(answers: impl IntoIterator<Item = OracleAnswer>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Queue answers for refinement requests.
    pub fn with_refinements(self, answers: impl IntoIterator<Item = OracleAnswer>) -> Self {
        self.refinements.borrow_mut().extend(answers);
        self
    }

    /// Code and context of every refinement request, in order.
    pub fn refine_calls(&self) -> Vec<(String, RefineContext)> {
        self.refine_calls.borrow().clone()
    }

    /// An oracle that always makes a fresh edit.
    pub fn appending() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.borrow().clone()
    }

    pub fn general_calls(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, OracleCall::General { .. }))
            .count()
    }

    pub fn hash_calls(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, OracleCall::Hash { .. }))
            .count()
    }

    fn answer(&self, code: &str) -> Result<String> {
        match self.answers.borrow_mut().pop_front() {
            Some(OracleAnswer::Code(code)) => Ok(code),
            Some(OracleAnswer::Unchanged) => Ok(code.to_string()),
            Some(OracleAnswer::Fail(message)) => Err(anyhow!(message)),
            None => Ok(format!(
                "{code}# attempt {}\n",
                self.calls.borrow().len()
            )),
        }
    }
}

impl CodeFixOracle for ScriptedOracle {
    fn fix_general(&self, code: &str, error: &BuildError, context: &FixContext) -> Result<String> {
        self.calls.borrow_mut().push(OracleCall::General {
            code: code.to_string(),
            kind: error.kind,
            context: context.clone(),
        });
        self.answer(code)
    }

    fn fix_hash(&self, code: &str, error: &BuildError) -> Result<String> {
        self.calls.borrow_mut().push(OracleCall::Hash {
            code: code.to_string(),
            kind: error.kind,
        });
        self.answer(code)
    }

    fn refine(&self, code: &str, context: &RefineContext) -> Result<String> {
        self.refine_calls
            .borrow_mut()
            .push((code.to_string(), context.clone()));
        match self.refinements.borrow_mut().pop_front() {
            Some(OracleAnswer::Code(refined)) => Ok(refined),
            Some(OracleAnswer::Fail(message)) => Err(anyhow!(message)),
            Some(OracleAnswer::Unchanged) | None => Ok(code.to_string()),
        }
    }
}

/// [`CodeFormatter`] with a fixed answer that records what it was given.
#[derive(Debug)]
pub struct ScriptedFormatter {
    output: Option<String>,
    seen: RefCell<Vec<String>>,
}

impl ScriptedFormatter {
    /// A formatter that always prints `formatted`.
    pub fn new(formatted: impl Into<String>) -> Self {
        Self {
            output: Some(formatted.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            output: None,
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.borrow().clone()
    }
}

impl CodeFormatter for ScriptedFormatter {
    fn format(&self, code: &str) -> Result<String> {
        self.seen.borrow_mut().push(code.to_string());
        self.output
            .clone()
            .ok_or_else(|| anyhow!("formatter rejected the code"))
    }
}

/// [`ProgressJudge`] that replays queued verdicts, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedJudge {
    verdicts: RefCell<VecDeque<ProgressVerdict>>,
    fallback: Option<ProgressVerdict>,
    seen: RefCell<Vec<LogComparison>>,
}

impl ScriptedJudge {
    pub fn new(verdicts: impl IntoIterator<Item = ProgressVerdict>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into_iter().collect()),
            fallback: None,
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn always(verdict: ProgressVerdict) -> Self {
        Self {
            fallback: Some(verdict),
            ..Self::new([])
        }
    }

    /// A judge that fails every request.
    pub fn failing() -> Self {
        Self::new([])
    }

    pub fn calls(&self) -> usize {
        self.seen.borrow().len()
    }

    pub fn seen(&self) -> Vec<LogComparison> {
        self.seen.borrow().clone()
    }
}

impl ProgressJudge for ScriptedJudge {
    fn judge(&self, comparison: &LogComparison) -> Result<ProgressVerdict> {
        self.seen.borrow_mut().push(comparison.clone());
        self.verdicts
            .borrow_mut()
            .pop_front()
            .or(self.fallback)
            .ok_or_else(|| anyhow!("judge has no verdict"))
    }
}

/// A scratch working tree initialized with `packloop init`.
pub struct TestRepo {
    dir: TempDir,
    pub paths: PackloopPaths,
    pub config: PackloopConfig,
}

impl TestRepo {
    pub fn new(initial_code: &str) -> Self {
        Self::with_config(initial_code, PackloopConfig::default())
    }

    pub fn with_config(initial_code: &str, config: PackloopConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(dir.path(), initial_code, &config, &InitOptions::default())
            .expect("init workspace");
        Self { dir, paths, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn package_path(&self) -> PathBuf {
        self.paths.package_path(&self.config)
    }

    pub fn git(&self) -> Git {
        Git::new(self.root())
    }

    pub fn store(&self) -> SolutionStore<Git> {
        SolutionStore::new(self.git(), self.package_path())
    }

    pub fn read_package(&self) -> String {
        fs::read_to_string(self.package_path()).expect("read package file")
    }
}

/// A build log of `count` numbered lines with the given prefix.
pub fn numbered_log(prefix: &str, count: usize) -> String {
    (1..=count)
        .map(|n| format!("{prefix} {n}"))
        .collect::<Vec<_>>()
        .join("\n")
}
