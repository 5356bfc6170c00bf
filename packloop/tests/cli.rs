//! CLI tests for `packloop` commands that need no Nix installation.
//!
//! Spawns the packloop binary and verifies exit codes and printed output.

use std::fs;
use std::process::Command;

use packloop::exit_codes;
use packloop::io::config::{PackloopConfig, load_config, write_config};
use packloop::io::init::PackloopPaths;

#[test]
fn init_creates_working_tree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let code_path = temp.path().join("hello.nix");
    fs::write(&code_path, "{ hello }: hello\n").expect("write code");
    let dir = temp.path().join("pkg");

    let output = Command::new(env!("CARGO_BIN_EXE_packloop"))
        .arg("init")
        .arg(&dir)
        .arg("--code")
        .arg(&code_path)
        .output()
        .expect("packloop init");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let paths = PackloopPaths::new(&dir);
    assert_eq!(
        load_config(&paths.config_path).expect("config"),
        PackloopConfig::default()
    );
    assert_eq!(
        fs::read_to_string(dir.join("package.nix")).expect("read package"),
        "{ hello }: hello\n"
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("package.nix"));
}

#[test]
fn run_outside_working_tree_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = Command::new(env!("CARGO_BIN_EXE_packloop"))
        .arg("run")
        .arg(temp.path())
        .status()
        .expect("packloop run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn compare_prints_full_log_diff_for_short_logs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let previous = temp.path().join("previous.log");
    let new = temp.path().join("new.log");
    fs::write(&previous, "configure\nerror: missing zlib").expect("write");
    fs::write(&new, "configure\nbuilding\nerror: missing openssl").expect("write");

    let output = Command::new(env!("CARGO_BIN_EXE_packloop"))
        .arg("compare")
        .arg(&previous)
        .arg(&new)
        .output()
        .expect("packloop compare");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["type"], "full_log_diff");
    assert_eq!(json["initial_lines"], 2);
    assert_eq!(json["improvement_lines"], 3);
}

/// Stand-in `nix` that resolves only when the flake named by the installable
/// exists relative to its working directory.
#[cfg(unix)]
fn write_fake_nix(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-nix");
    fs::write(
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
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod fake nix");
    script
}

#[cfg(unix)]
#[test]
fn build_accepts_relative_working_tree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let code_path = temp.path().join("hello.nix");
    fs::write(&code_path, "{ hello }: hello\n").expect("write code");

    let init = Command::new(env!("CARGO_BIN_EXE_packloop"))
        .current_dir(temp.path())
        .args(["init", "work/pkg", "--code"])
        .arg(&code_path)
        .status()
        .expect("packloop init");
    assert_eq!(init.code(), Some(exit_codes::OK));

    let paths = PackloopPaths::new(temp.path().join("work").join("pkg"));
    let mut cfg = load_config(&paths.config_path).expect("config");
    cfg.build.program = write_fake_nix(temp.path()).display().to_string();
    write_config(&paths.config_path, &cfg).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_packloop"))
        .current_dir(temp.path())
        .args(["build", "work/pkg"])
        .output()
        .expect("packloop build");

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&output.stdout)
    );
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["success"], true);
}
