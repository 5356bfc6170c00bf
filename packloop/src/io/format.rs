//! Source formatting of the final package file.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::io::config::FormatterConfig;
use crate::io::process::run_command_with_timeout;

const FORMATTER_OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Rewrites package code into canonical layout.
pub trait CodeFormatter {
    fn format(&self, code: &str) -> Result<String>;
}

/// [`CodeFormatter`] that pipes the code through an external command.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandFormatter {
    /// `None` when no formatter command is configured.
    pub fn from_config(workdir: impl Into<PathBuf>, cfg: &FormatterConfig) -> Option<Self> {
        cfg.enabled().then(|| Self {
            command: cfg.command.clone(),
            workdir: workdir.into(),
            timeout: cfg.timeout(),
        })
    }
}

impl CodeFormatter for CommandFormatter {
    #[instrument(skip_all)]
    fn format(&self, code: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("formatter command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let out = run_command_with_timeout(
            cmd,
            Some(code.as_bytes()),
            self.timeout,
            FORMATTER_OUTPUT_LIMIT_BYTES,
        )?;
        if !out.succeeded() {
            bail!(
                "formatter {program} failed: {}",
                out.stderr_text("format", self.timeout).trim()
            );
        }
        if out.stdout_truncated > 0 {
            bail!("formatter {program} output exceeded {FORMATTER_OUTPUT_LIMIT_BYTES} bytes");
        }
        let formatted = out.stdout_text();
        if formatted.trim().is_empty() {
            bail!("formatter {program} printed nothing");
        }
        debug!(changed = formatted != code, "formatted package");
        Ok(formatted)
    }
}
