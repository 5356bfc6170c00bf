//! Packloop configuration stored under `.packloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::decision::LoopLimits;

/// Packloop configuration (TOML).
///
/// Missing fields default to values that suit a typical package build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackloopConfig {
    /// Oracle calls allowed per session.
    pub max_iterations: u32,

    pub max_consecutive_rebuilds_without_progress: u32,

    /// Eval/hash/dependency failures in a row before rolling back to the best solution.
    pub max_consecutive_non_build_errors: u32,

    /// When false, every distinct build error counts as progress and the judge is never asked.
    pub progress_evaluation_enabled: bool,

    /// Lines per page when an error is shown to the oracle.
    pub error_page_lines: usize,

    /// Window size for long log comparisons.
    pub log_comparison_max_lines: usize,

    /// Write per-iteration artifacts under `.packloop/iterations/`.
    pub iteration_logs: bool,

    /// Improvement rounds asked for once the package builds; 0 skips refinement.
    pub refinement_rounds: u32,

    pub build: BuildConfig,
    pub oracle: OracleConfig,
    pub formatter: FormatterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Build tool binary.
    pub program: String,
    /// Flake output attribute to build.
    pub attr: String,
    /// File under edit, relative to the working directory.
    pub package_file: String,
    pub timeout_secs: u64,
    /// Truncate build tool stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Oracle command. `{output}` and `{schema}` in arguments are substituted.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Total attempts per oracle request, including the first.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
}

/// Code formatter run on the final package, e.g. `["nixfmt"]`.
///
/// Reads the code on stdin and prints the formatted code. An empty command
/// disables formatting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FormatterConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: "nix".to_string(),
            attr: "default".to_string(),
            package_file: "package.nix".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--output-schema".to_string(),
                "{schema}".to_string(),
                "--output-last-message".to_string(),
                "{output}".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1024 * 1024,
            retry_attempts: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl Default for PackloopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_consecutive_rebuilds_without_progress: 10,
            max_consecutive_non_build_errors: 5,
            progress_evaluation_enabled: true,
            error_page_lines: 256,
            log_comparison_max_lines: 240,
            iteration_logs: true,
            refinement_rounds: 3,
            build: BuildConfig::default(),
            oracle: OracleConfig::default(),
            formatter: FormatterConfig::default(),
        }
    }
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl FormatterConfig {
    pub fn enabled(&self) -> bool {
        !self.command.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PackloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_consecutive_rebuilds_without_progress == 0 {
            return Err(anyhow!(
                "max_consecutive_rebuilds_without_progress must be > 0"
            ));
        }
        if self.max_consecutive_non_build_errors == 0 {
            return Err(anyhow!("max_consecutive_non_build_errors must be > 0"));
        }
        if self.error_page_lines == 0 {
            return Err(anyhow!("error_page_lines must be > 0"));
        }
        if self.log_comparison_max_lines == 0 {
            return Err(anyhow!("log_comparison_max_lines must be > 0"));
        }
        if self.build.program.trim().is_empty() {
            return Err(anyhow!("build.program must be non-empty"));
        }
        if self.build.attr.trim().is_empty() {
            return Err(anyhow!("build.attr must be non-empty"));
        }
        let package_file = Path::new(&self.build.package_file);
        if self.build.package_file.trim().is_empty() || package_file.is_absolute() {
            return Err(anyhow!("build.package_file must be a relative path"));
        }
        if self.build.timeout_secs == 0 {
            return Err(anyhow!("build.timeout_secs must be > 0"));
        }
        if self.build.output_limit_bytes == 0 {
            return Err(anyhow!("build.output_limit_bytes must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.oracle.retry_attempts == 0 {
            return Err(anyhow!("oracle.retry_attempts must be > 0"));
        }
        if self.formatter.enabled() && self.formatter.command[0].trim().is_empty() {
            return Err(anyhow!("formatter.command must start with a program"));
        }
        if self.formatter.timeout_secs == 0 {
            return Err(anyhow!("formatter.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_iterations: self.max_iterations,
            max_consecutive_rebuilds_without_progress: self
                .max_consecutive_rebuilds_without_progress,
            max_consecutive_non_build_errors: self.max_consecutive_non_build_errors,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PackloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<PackloopConfig> {
    if !path.exists() {
        let cfg = PackloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PackloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PackloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
