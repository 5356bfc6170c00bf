//! Working tree layout and `packloop init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::info;

use crate::io::config::{PackloopConfig, write_config};
use crate::io::git::{Git, VersionControl};

const FLAKE_TEMPLATE: &str = include_str!("templates/flake.nix");

/// `.packloop/` holds only untracked session state, so rollbacks never touch it.
const STATE_GITIGNORE: &str = "*\n";

/// All canonical paths for a packaging working tree.
#[derive(Debug, Clone)]
pub struct PackloopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub summary_path: PathBuf,
    pub iterations_dir: PathBuf,
    pub oracle_dir: PathBuf,
    pub flake_path: PathBuf,
}

impl PackloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".packloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            summary_path: state_dir.join("summary.md"),
            iterations_dir: state_dir.join("iterations"),
            oracle_dir: state_dir.join("oracle"),
            flake_path: root.join("flake.nix"),
        }
    }

    /// Path of the file under edit.
    pub fn package_path(&self, cfg: &PackloopConfig) -> PathBuf {
        self.root.join(&cfg.build.package_file)
    }

    /// Project notes for the oracle, if the user left any.
    pub fn read_summary(&self) -> Result<Option<String>> {
        if !self.summary_path.exists() {
            return Ok(None);
        }
        let summary = fs::read_to_string(&self.summary_path)
            .with_context(|| format!("read {}", self.summary_path.display()))?;
        Ok(Some(summary))
    }
}

/// Options for [`init_workspace`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, reinitialize a directory that already has `.packloop/`.
    pub force: bool,
}

/// Create a working tree for `code`: flake, package file, state dir and an initial commit.
///
/// An existing `flake.nix` and git repository are reused.
pub fn init_workspace(
    root: &Path,
    code: &str,
    cfg: &PackloopConfig,
    options: &InitOptions,
) -> Result<PackloopPaths> {
    cfg.validate()?;
    let paths = PackloopPaths::new(root);
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "packloop init: .packloop already exists (use --force to overwrite)"
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "packloop init: .packloop exists but is not a directory"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;
    write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    write_config(&paths.config_path, cfg)?;

    if !paths.flake_path.exists() {
        write_file(&paths.flake_path, &render_flake(cfg)?)?;
    }
    write_file(&paths.package_path(cfg), code)?;

    let git = Git::new(root);
    if !git.is_repo() {
        git.init()?;
    }
    let commit_id = git.commit("packloop: initial code")?;
    info!(root = %root.display(), commit_id = %commit_id, "initialized working tree");

    Ok(paths)
}

fn render_flake(cfg: &PackloopConfig) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(
        FLAKE_TEMPLATE,
        context! {
            attr => cfg.build.attr.as_str(),
            package_file => cfg.build.package_file.as_str(),
        },
    )?;
    Ok(format!("{}\n", rendered.trim_end()))
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
