//! Nix packaging repair loop.
//!
//! `packloop init` turns a directory into a working tree (flake, package file,
//! `.packloop/` state, git repository). `packloop run` then builds the package,
//! asks the configured oracle for fixes, and keeps the edits that get the
//! build further until it succeeds or a ceiling is hit.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use packloop::core::log_diff::{DEFAULT_MAX_LINES, compare_logs};
use packloop::exit_codes;
use packloop::io::build::{NixBuildTool, build_with_source_check, invoke_build};
use packloop::io::config::load_config;
use packloop::io::format::CommandFormatter;
use packloop::io::git::Git;
use packloop::io::init::{InitOptions, PackloopPaths, init_workspace};
use packloop::io::oracle::CommandOracle;
use packloop::io::solution_store::SolutionStore;
use packloop::logging;
use packloop::packaging::{LoopSettings, LoopStop, PackagingLoop};

#[derive(Parser)]
#[command(
    name = "packloop",
    version,
    about = "Build, classify, repair and evaluate loop for failing Nix packages"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a working tree: flake, package file, `.packloop/` and an initial commit.
    Init {
        /// Directory to initialize.
        dir: PathBuf,
        /// File holding the initial package expression.
        #[arg(long)]
        code: PathBuf,
        /// Reinitialize an existing working tree.
        #[arg(short, long)]
        force: bool,
    },
    /// Build the package once and print the classified result as JSON.
    Build {
        dir: PathBuf,
        /// Only build the source derivation.
        #[arg(long)]
        source_only: bool,
    },
    /// Compare two build logs the way the progress judge sees them.
    Compare {
        previous: PathBuf,
        new: PathBuf,
        /// Window size for long logs.
        #[arg(long, default_value_t = DEFAULT_MAX_LINES)]
        max_lines: usize,
    },
    /// Run the repair loop until the package builds or a ceiling is hit.
    Run {
        dir: PathBuf,
        /// Project notes for the oracle; overrides `.packloop/summary.md`.
        #[arg(long)]
        summary: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { dir, code, force } => cmd_init(&dir, &code, force),
        Command::Build { dir, source_only } => cmd_build(&dir, source_only),
        Command::Compare {
            previous,
            new,
            max_lines,
        } => cmd_compare(&previous, &new, max_lines),
        Command::Run { dir, summary } => cmd_run(&dir, summary.as_deref()),
    }
}

fn cmd_init(dir: &Path, code_path: &Path, force: bool) -> Result<i32> {
    let code = read_text(code_path)?;
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let dir = &working_tree(dir)?;
    let paths = PackloopPaths::new(dir);
    let cfg = load_config(&paths.config_path)?;
    let paths = init_workspace(dir, &code, &cfg, &InitOptions { force })?;
    println!("{}", paths.package_path(&cfg).display());
    Ok(exit_codes::OK)
}

fn cmd_build(dir: &Path, source_only: bool) -> Result<i32> {
    let dir = &working_tree(dir)?;
    let paths = existing_paths(dir)?;
    let cfg = load_config(&paths.config_path)?;
    let tool = NixBuildTool::new(dir, &cfg.build);
    let result = if source_only {
        invoke_build(&tool, true)?
    } else {
        build_with_source_check(&tool)?
    };
    print_json(&result)?;
    Ok(if result.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_compare(previous: &Path, new: &Path, max_lines: usize) -> Result<i32> {
    if max_lines == 0 {
        bail!("--max-lines must be >= 1");
    }
    let comparison = compare_logs(&read_text(previous)?, &read_text(new)?, max_lines);
    print_json(&comparison)?;
    Ok(exit_codes::OK)
}

fn cmd_run(dir: &Path, summary: Option<&Path>) -> Result<i32> {
    let dir = &working_tree(dir)?;
    let paths = existing_paths(dir)?;
    let cfg = load_config(&paths.config_path)?;

    let mut settings = LoopSettings::from_config(&cfg);
    settings.project_summary = match summary {
        Some(path) => Some(read_text(path)?),
        None => paths.read_summary()?,
    };
    if cfg.iteration_logs {
        settings.iterations_dir = Some(paths.iterations_dir.clone());
    }

    let mut store = SolutionStore::new(Git::new(dir), paths.package_path(&cfg));
    let initial_code = store.read_code()?;
    let tool = NixBuildTool::new(dir, &cfg.build);
    let oracle = CommandOracle::new(dir, &paths.oracle_dir, &cfg.oracle);
    let formatter = CommandFormatter::from_config(dir, &cfg.formatter);

    let mut packaging = PackagingLoop::new(&mut store, &tool, &oracle, &oracle, &settings);
    if let Some(formatter) = &formatter {
        packaging = packaging.with_formatter(formatter);
    }
    let outcome = packaging.run(&initial_code, |report| {
        eprintln!(
            "iteration {}: {:?} -> {:?}",
            report.iteration, report.error_kind, report.action
        );
    })?;

    match outcome.stop {
        LoopStop::Succeeded { .. } => {
            if outcome.refinements > 0 {
                eprintln!("kept {} refinement edit(s)", outcome.refinements);
            }
            println!("{}", paths.package_path(&cfg).display());
            Ok(exit_codes::OK)
        }
        LoopStop::Failed(reason) => {
            eprintln!("packloop run: {reason}");
            Ok(exit_codes::FAILED)
        }
    }
}

/// Absolute form of a working tree argument; child processes run inside it.
fn working_tree(dir: &Path) -> Result<PathBuf> {
    fs::canonicalize(dir).with_context(|| format!("resolve {}", dir.display()))
}

fn existing_paths(dir: &Path) -> Result<PackloopPaths> {
    let paths = PackloopPaths::new(dir);
    if !paths.state_dir.is_dir() {
        bail!(
            "{} is not a packloop working tree (run `packloop init` first)",
            dir.display()
        );
    }
    Ok(paths)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_with_code() {
        let cli = Cli::parse_from(["packloop", "init", "pkg", "--code", "hello.nix"]);
        match cli.command {
            Command::Init { dir, code, force } => {
                assert_eq!(dir, PathBuf::from("pkg"));
                assert_eq!(code, PathBuf::from("hello.nix"));
                assert!(!force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn parse_init_requires_code() {
        assert!(Cli::try_parse_from(["packloop", "init", "pkg"]).is_err());
    }

    #[test]
    fn parse_build_source_only() {
        let cli = Cli::parse_from(["packloop", "build", "pkg", "--source-only"]);
        assert!(matches!(
            cli.command,
            Command::Build {
                source_only: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_compare_defaults_max_lines() {
        let cli = Cli::parse_from(["packloop", "compare", "a.log", "b.log"]);
        assert!(matches!(
            cli.command,
            Command::Compare {
                max_lines: DEFAULT_MAX_LINES,
                ..
            }
        ));
    }

    #[test]
    fn parse_run_with_summary() {
        let cli = Cli::parse_from(["packloop", "run", "pkg", "--summary", "notes.md"]);
        match cli.command {
            Command::Run { dir, summary } => {
                assert_eq!(dir, PathBuf::from("pkg"));
                assert_eq!(summary, Some(PathBuf::from("notes.md")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn working_tree_is_made_absolute() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join("a").join("b");
        fs::create_dir_all(&nested).expect("mkdir");
        let resolved = working_tree(&temp.path().join("a").join("..").join("a").join("b"))
            .expect("resolve");
        assert!(resolved.is_absolute());
        assert_eq!(resolved, fs::canonicalize(&nested).expect("canonicalize"));
    }

    #[test]
    fn missing_working_tree_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(working_tree(&temp.path().join("absent")).is_err());
    }

    #[test]
    fn run_outside_working_tree_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = existing_paths(temp.path()).unwrap_err();
        assert!(err.to_string().contains("packloop init"));
    }
}
