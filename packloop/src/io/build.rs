//! Build invocation: resolve the plan, build it, fetch the log on failure.
//!
//! Each step is a separate call on a [`BuildTool`] so the invoker can stop
//! between them. Classification of whatever fails is delegated to
//! [`crate::core::classifier`].

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::classifier::{FailureEvidence, HASH_MISMATCH_SIGNATURE, classify};
use crate::core::types::{BuildError, BuildResult, ErrorKind};
use crate::io::config::BuildConfig;
use crate::io::process::run_command_with_timeout;

/// Which output the build plan is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    /// The full package.
    Package,
    /// Only the package's source fetch.
    Source,
}

/// Captured result of one build tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// The three build tool calls the invoker can fail fast between.
///
/// `Err` is reserved for failures to run the tool at all (missing binary,
/// unreadable working directory); a tool that runs and fails returns
/// `Ok` with `success = false`.
pub trait BuildTool {
    /// Resolve the build plan; on success `stdout` names the plan.
    fn resolve_plan(&self, target: BuildTarget) -> Result<ToolOutput>;
    /// Build a resolved plan.
    fn execute_build(&self, plan: &str) -> Result<ToolOutput>;
    /// Fetch the log of a failed build; on success `stdout` is the log.
    fn fetch_log(&self, plan: &str) -> Result<ToolOutput>;
}

/// [`BuildTool`] backed by the `nix` CLI against a flake directory.
#[derive(Debug, Clone)]
pub struct NixBuildTool {
    program: String,
    flake_dir: PathBuf,
    attr: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl NixBuildTool {
    pub fn new(flake_dir: impl Into<PathBuf>, cfg: &BuildConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            flake_dir: flake_dir.into(),
            attr: cfg.attr.clone(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// Installables are relative to the flake, since `nix` runs inside it.
    fn installable(&self, target: BuildTarget) -> String {
        match target {
            BuildTarget::Package => format!(".#{}", self.attr),
            BuildTarget::Source => format!(".#{}.src", self.attr),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--extra-experimental-features", "nix-command flakes"])
            .args(args)
            .current_dir(&self.flake_dir);
        cmd
    }

    fn run(&self, label: &str, args: &[&str]) -> Result<ToolOutput> {
        let out = run_command_with_timeout(
            self.command(args),
            None,
            self.timeout,
            self.output_limit_bytes,
        )?;
        Ok(ToolOutput {
            success: out.succeeded(),
            stdout: out.stdout_text(),
            stderr: out.stderr_text(label, self.timeout),
            timed_out: out.timed_out,
        })
    }
}

impl BuildTool for NixBuildTool {
    fn resolve_plan(&self, target: BuildTarget) -> Result<ToolOutput> {
        let installable = self.installable(target);
        self.run("eval", &["path-info", "--derivation", &installable])
    }

    fn execute_build(&self, plan: &str) -> Result<ToolOutput> {
        let timeout = self.timeout.as_secs().to_string();
        let outputs = format!("{plan}^*");
        self.run(
            "build",
            &["build", "--timeout", &timeout, &outputs, "--no-link"],
        )
    }

    fn fetch_log(&self, plan: &str) -> Result<ToolOutput> {
        let outputs = format!("{plan}^*");
        self.run("log", &["log", &outputs])
    }
}

/// Run one build invocation and classify any failure.
#[instrument(skip_all, fields(source_check_only))]
pub fn invoke_build(tool: &dyn BuildTool, source_check_only: bool) -> Result<BuildResult> {
    let target = if source_check_only {
        BuildTarget::Source
    } else {
        BuildTarget::Package
    };

    let resolved = tool.resolve_plan(target)?;
    if !resolved.success {
        let error = classify(&FailureEvidence::Resolution {
            stderr: &resolved.stderr,
        });
        debug!(kind = error.kind.as_str(), "plan resolution failed");
        return Ok(BuildResult::failed(source_check_only, error));
    }
    let Some(plan) = resolved.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        let error = BuildError::new(
            ErrorKind::EvalError,
            format!("build plan resolution produced no plan\n{}", resolved.stderr),
        );
        return Ok(BuildResult::failed(source_check_only, error));
    };
    info!(plan, "building");

    let built = tool.execute_build(plan)?;
    if built.success {
        debug!("build succeeded");
        return Ok(BuildResult::succeeded(source_check_only));
    }

    // A hash mismatch is known before any log exists.
    let log = if built.stderr.contains(HASH_MISMATCH_SIGNATURE) {
        None
    } else {
        let fetched = tool.fetch_log(plan)?;
        fetched.success.then_some(fetched.stdout)
    };
    let error = classify(&FailureEvidence::Build {
        stderr: &built.stderr,
        log: log.as_deref(),
    });
    debug!(kind = error.kind.as_str(), timed_out = built.timed_out, "build failed");
    Ok(BuildResult::failed(source_check_only, error))
}

/// Check the source fetch first and run the full build only if it resolves.
///
/// Only the final result is returned.
pub fn build_with_source_check(tool: &dyn BuildTool) -> Result<BuildResult> {
    let source = invoke_build(tool, true)?;
    if !source.success {
        return Ok(source);
    }
    invoke_build(tool, false)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Fixed answers per call, with a record of the calls made.
    #[derive(Default)]
    struct FakeTool {
        resolve: Option<ToolOutput>,
        resolve_source: Option<ToolOutput>,
        build: Option<ToolOutput>,
        log: Option<ToolOutput>,
        calls: RefCell<Vec<String>>,
    }

    impl BuildTool for FakeTool {
        fn resolve_plan(&self, target: BuildTarget) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(format!("resolve {target:?}"));
            let out = match target {
                BuildTarget::Source => self.resolve_source.clone(),
                BuildTarget::Package => self.resolve.clone(),
            };
            Ok(out.unwrap_or_else(|| ToolOutput::ok("/nix/store/x.drv\n")))
        }

        fn execute_build(&self, plan: &str) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(format!("build {plan}"));
            Ok(self.build.clone().unwrap_or_else(|| ToolOutput::ok("")))
        }

        fn fetch_log(&self, plan: &str) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(format!("log {plan}"));
            Ok(self
                .log
                .clone()
                .unwrap_or_else(|| ToolOutput::failed("no log")))
        }
    }

    #[test]
    fn successful_build_has_no_error() {
        let tool = FakeTool::default();
        let result = invoke_build(&tool, false).expect("invoke");
        assert!(result.is_terminal_success());
        assert_eq!(
            *tool.calls.borrow(),
            vec!["resolve Package", "build /nix/store/x.drv"]
        );
    }

    #[test]
    fn resolution_failure_stops_before_building() {
        let tool = FakeTool {
            resolve: Some(ToolOutput::failed("error: undefined variable 'foo'")),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        assert_eq!(result.error_kind(), Some(ErrorKind::EvalError));
        assert_eq!(tool.calls.borrow().len(), 1);
    }

    #[test]
    fn empty_plan_is_eval_error() {
        let tool = FakeTool {
            resolve: Some(ToolOutput::ok("  \n")),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        assert_eq!(result.error_kind(), Some(ErrorKind::EvalError));
    }

    #[test]
    fn hash_mismatch_skips_log_fetch() {
        let tool = FakeTool {
            build: Some(ToolOutput::failed(
                "error: hash mismatch in fixed-output derivation\n specified: sha256-AAAA\n got: sha256-BBBB",
            )),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        assert_eq!(result.error_kind(), Some(ErrorKind::HashMismatch));
        assert!(!tool.calls.borrow().iter().any(|c| c.starts_with("log")));
    }

    #[test]
    fn build_failure_uses_fetched_log() {
        let tool = FakeTool {
            build: Some(ToolOutput::failed("error: builder failed")),
            log: Some(ToolOutput::ok("configure: error: missing zlib")),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        let error = result.error.expect("error");
        assert_eq!(error.kind, ErrorKind::BuildError);
        assert_eq!(error.message, "configure: error: missing zlib");
    }

    #[test]
    fn missing_log_is_dependency_error() {
        let tool = FakeTool {
            build: Some(ToolOutput::failed("error: 1 dependencies failed")),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        let error = result.error.expect("error");
        assert_eq!(error.kind, ErrorKind::DependencyBuildError);
        assert!(error.message.contains("dependencies failed"));
    }

    #[test]
    fn invalid_hash_in_build_stderr_still_fetches_log() {
        let tool = FakeTool {
            build: Some(ToolOutput::failed(
                "error: builder failed\nwarning: invalid SRI hash 'abc' in vendored lockfile",
            )),
            log: Some(ToolOutput::ok("npm ERR! integrity check failed")),
            ..FakeTool::default()
        };
        let result = invoke_build(&tool, false).expect("invoke");
        let error = result.error.expect("error");
        assert_eq!(error.kind, ErrorKind::BuildError);
        assert_eq!(error.message, "npm ERR! integrity check failed");
        assert!(tool.calls.borrow().iter().any(|c| c.starts_with("log")));
    }

    #[test]
    fn source_check_failure_skips_full_build() {
        let tool = FakeTool {
            resolve_source: Some(ToolOutput::failed("error: invalid SRI hash 'abc'")),
            ..FakeTool::default()
        };
        let result = build_with_source_check(&tool).expect("build");
        assert!(result.source_check_only);
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidHash));
        assert_eq!(*tool.calls.borrow(), vec!["resolve Source"]);
    }

    #[test]
    fn source_check_success_runs_full_build() {
        let tool = FakeTool::default();
        let result = build_with_source_check(&tool).expect("build");
        assert!(result.is_terminal_success());
        assert_eq!(
            *tool.calls.borrow(),
            vec![
                "resolve Source",
                "build /nix/store/x.drv",
                "resolve Package",
                "build /nix/store/x.drv",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn nix_tool_spawn_failure_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = BuildConfig {
            program: "/definitely/not/nix".to_string(),
            ..BuildConfig::default()
        };
        let tool = NixBuildTool::new(temp.path(), &cfg);
        assert!(invoke_build(&tool, false).is_err());
    }

    #[test]
    fn nix_installables_are_relative_to_the_flake() {
        let cfg = BuildConfig::default();
        let tool = NixBuildTool::new("work/pkg", &cfg);
        assert_eq!(tool.installable(BuildTarget::Package), ".#default");
        assert_eq!(tool.installable(BuildTarget::Source), ".#default.src");
    }

    /// Stand-in `nix` that resolves only when the flake is in its working
    /// directory and the installable names it relative to there.
    #[cfg(unix)]
    fn fake_nix(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-nix");
        std::fs::write(
            &script,
            r#"#!/bin/sh
for last; do :; done
case "$*" in
  *path-info*)
    flake="${last%%#*}"
    if [ -f "$flake/flake.nix" ]; then
      echo /nix/store/fake-pkg.drv
    else
      echo "error: cwd=$(pwd) no flake at $flake" >&2
      exit 1
    fi
    ;;
  *build*) exit 0 ;;
esac
"#,
        )
        .expect("write fake nix");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake nix");
        script.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn nix_tool_resolves_flake_from_its_own_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flake_dir = temp.path().join("work").join("pkg");
        std::fs::create_dir_all(&flake_dir).expect("mkdir");
        std::fs::write(flake_dir.join("flake.nix"), "{ outputs = _: { }; }\n").expect("flake");
        let cfg = BuildConfig {
            program: fake_nix(temp.path()),
            ..BuildConfig::default()
        };

        let tool = NixBuildTool::new(&flake_dir, &cfg);
        let result = invoke_build(&tool, false).expect("invoke");
        assert!(result.is_terminal_success(), "{:?}", result.error);
    }
}
