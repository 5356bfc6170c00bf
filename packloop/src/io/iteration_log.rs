//! Iteration logging helpers for `.packloop/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::decision::IterationReport;
use crate::core::types::BuildError;

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub code_path: PathBuf,
    pub error_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iter: u32) -> Self {
        let dir = iterations_dir.join(iter.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            code_path: dir.join("code.nix"),
            error_log_path: dir.join("error.log"),
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub iterations_dir: &'a Path,
    pub report: &'a IterationReport,
    /// Code produced by this iteration's edit.
    pub code: &'a str,
    /// Error of the rebuilt candidate, if any.
    pub error: Option<&'a BuildError>,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<IterationPaths> {
    let paths = IterationPaths::new(request.iterations_dir, request.report.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.report)?;
    write_text(&paths.code_path, request.code)?;
    if let Some(error) = request.error {
        write_text(&paths.error_log_path, &error.message)?;
    }

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
