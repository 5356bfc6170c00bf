//! Oracle seams: code fixes and progress judgements.
//!
//! [`CodeFixOracle`] and [`ProgressJudge`] decouple the loop from whatever
//! produces edits. The shipped [`CommandOracle`] runs an external agent
//! command; tests use scripted oracles that never spawn processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::log_diff::LogComparison;
use crate::core::types::{BuildError, ProgressVerdict};
use crate::io::config::OracleConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptEngine;
use crate::io::retry::{RetryPolicy, with_retry};

const FIX_OUTPUT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/fix_output.schema.json"
));
const JUDGE_OUTPUT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/judge_output.schema.json"
));

static NIX_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?ms)^```nix\n(.*?)\n```$").unwrap());

/// Extra facts passed along with a general fix request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixContext {
    /// No build error had been recorded before this one.
    pub first_build_error: bool,
    /// The last judgement found the build log unreadable.
    pub broken_log_output: bool,
    /// Free-form notes about the project being packaged.
    pub project_summary: Option<String>,
    /// Lines per page when the error is paginated.
    pub page_lines: usize,
}

/// Where a refinement request sits in the refinement phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefineContext {
    /// 1-based round number.
    pub round: u32,
    pub max_rounds: u32,
    pub project_summary: Option<String>,
}

/// Produces replacement code for a package file.
pub trait CodeFixOracle {
    /// Fix any non-hash error. Returns the full new file contents.
    fn fix_general(&self, code: &str, error: &BuildError, context: &FixContext) -> Result<String>;
    /// Fix a hash error with a surgical edit. Returns the full new file contents.
    fn fix_hash(&self, code: &str, error: &BuildError) -> Result<String>;
    /// Review a package that already builds and return an improved version.
    /// Returning `code` unchanged means there is nothing left to improve.
    fn refine(&self, code: &str, context: &RefineContext) -> Result<String>;
}

/// Breaks ties between two distinct build logs.
pub trait ProgressJudge {
    fn judge(&self, comparison: &LogComparison) -> Result<ProgressVerdict>;
}

#[derive(Debug, Deserialize)]
struct FixOutput {
    code: String,
}

#[derive(Debug, Deserialize)]
struct JudgeOutput {
    verdict: ProgressVerdict,
}

/// Oracle backed by an external command.
///
/// The prompt goes to the command's stdin. `{output}` and `{schema}` in its
/// arguments are replaced with the response file and the JSON Schema the
/// response must satisfy. A command that writes no response file may print
/// the JSON on stdout instead.
pub struct CommandOracle {
    command: Vec<String>,
    workdir: PathBuf,
    scratch_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    retry: RetryPolicy,
    prompts: PromptEngine,
}

impl CommandOracle {
    /// `workdir` is where the command runs; request files live in `scratch_dir`.
    pub fn new(
        workdir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        cfg: &OracleConfig,
    ) -> Self {
        Self {
            command: cfg.command.clone(),
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            retry: RetryPolicy::new(
                cfg.retry_attempts,
                Duration::from_millis(cfg.retry_backoff_ms),
            ),
            prompts: PromptEngine::new(),
        }
    }

    fn ask<T: DeserializeOwned>(&self, kind: &str, prompt: &str, schema: &str) -> Result<T> {
        let value = with_retry(kind, self.retry, |attempt| {
            self.run_once(kind, prompt, schema, attempt)
        })?;
        serde_json::from_value(value).with_context(|| format!("decode {kind} response"))
    }

    #[instrument(skip_all, fields(kind))]
    fn run_once(&self, kind: &str, prompt: &str, schema: &str, attempt: u32) -> Result<Value> {
        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        let schema_path = self.scratch_dir.join(format!("{kind}.schema.json"));
        let output_path = self.scratch_dir.join(format!("{kind}.output.json"));
        fs::write(&schema_path, schema)
            .with_context(|| format!("write {}", schema_path.display()))?;
        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(substitute(arg, &output_path, &schema_path));
        }
        cmd.current_dir(&self.workdir);

        info!(program = %program, attempt, "asking oracle");
        let out = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run oracle command")?;

        if out.timed_out {
            bail!("oracle timed out after {}s", self.timeout.as_secs());
        }
        if !out.status.success() {
            let stderr = out.stderr_text("oracle", self.timeout);
            warn!(exit_code = ?out.status.code(), "oracle command failed");
            bail!(
                "oracle exited with status {:?}: {}",
                out.status.code(),
                stderr.trim()
            );
        }

        let raw = if output_path.exists() {
            fs::read_to_string(&output_path)
                .with_context(|| format!("read {}", output_path.display()))?
        } else {
            debug!("no response file, using stdout");
            out.stdout_text()
        };
        let value: Value = serde_json::from_str(raw.trim())
            .with_context(|| format!("parse {kind} response as JSON"))?;
        validate_response(schema, &value)?;
        Ok(value)
    }
}

impl CodeFixOracle for CommandOracle {
    fn fix_general(&self, code: &str, error: &BuildError, context: &FixContext) -> Result<String> {
        let prompt = self.prompts.render_fix_general(code, error, context)?;
        let output: FixOutput = self.ask("fix", &prompt, FIX_OUTPUT_SCHEMA)?;
        Ok(unwrap_code_block(&output.code))
    }

    fn fix_hash(&self, code: &str, error: &BuildError) -> Result<String> {
        let prompt = self.prompts.render_fix_hash(code, error)?;
        let output: FixOutput = self.ask("fix_hash", &prompt, FIX_OUTPUT_SCHEMA)?;
        Ok(unwrap_code_block(&output.code))
    }

    fn refine(&self, code: &str, context: &RefineContext) -> Result<String> {
        let prompt = self.prompts.render_refine(code, context)?;
        let output: FixOutput = self.ask("refine", &prompt, FIX_OUTPUT_SCHEMA)?;
        Ok(unwrap_code_block(&output.code))
    }
}

impl ProgressJudge for CommandOracle {
    fn judge(&self, comparison: &LogComparison) -> Result<ProgressVerdict> {
        let prompt = self.prompts.render_judge(comparison)?;
        let output: JudgeOutput = self.ask("judge", &prompt, JUDGE_OUTPUT_SCHEMA)?;
        debug!(verdict = output.verdict.as_str(), "judge answered");
        Ok(output.verdict)
    }
}

fn substitute(arg: &str, output_path: &Path, schema_path: &Path) -> String {
    arg.replace("{output}", &output_path.to_string_lossy())
        .replace("{schema}", &schema_path.to_string_lossy())
}

fn validate_response(schema: &str, value: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(schema).context("parse response schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("response schema validation failed: {}", messages.join("; "));
    }
    Ok(())
}

/// Take the first ```nix block if the oracle wrapped its code in one.
pub fn unwrap_code_block(code: &str) -> String {
    match NIX_FENCE_RE.captures(code).and_then(|caps| caps.get(1)) {
        Some(block) => format!("{}\n", block.as_str()),
        None => code.to_string(),
    }
}
