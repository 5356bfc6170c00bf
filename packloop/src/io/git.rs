//! Git adapter backing the solution store.
//!
//! Every attempted solution is committed so a rollback is an exact
//! `git reset --hard` to a known commit. The solution store is the only caller.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Durable version control for the working tree.
pub trait VersionControl {
    /// Stage everything and commit; return the new commit id.
    fn commit(&self, message: &str) -> Result<String>;
    /// Restore the working tree and index to `commit_id`.
    fn reset(&self, commit_id: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Create a repository with a local identity so commits never depend on global config.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn init(&self) -> Result<()> {
        debug!("initializing repository");
        self.run_checked(&["init", "--quiet"])?;
        self.run_checked(&["config", "user.name", "packloop"])?;
        self.run_checked(&["config", "user.email", "packloop@localhost"])?;
        self.run_checked(&["config", "commit.gpgsign", "false"])?;
        Ok(())
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the full HEAD sha.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit whatever is staged. Empty commits are allowed so every build gets its own id.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<()> {
        debug!("committing staged changes");
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        Ok(())
    }

    #[instrument(skip_all, fields(commit_id))]
    pub fn reset_hard(&self, commit_id: &str) -> Result<()> {
        debug!(commit_id, "resetting working tree");
        self.run_checked(&["reset", "--quiet", "--hard", commit_id])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    fn commit(&self, message: &str) -> Result<String> {
        self.add_all()?;
        self.commit_staged(message)?;
        self.head_sha()
    }

    fn reset(&self, commit_id: &str) -> Result<()> {
        self.reset_hard(commit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, Git) {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = Git::new(dir.path());
        git.init().expect("init");
        (dir, git)
    }

    #[test]
    fn commit_returns_head_sha() {
        let (dir, git) = repo();
        std::fs::write(dir.path().join("a.txt"), "one").expect("write");
        let sha = git.commit("first").expect("commit");
        assert_eq!(sha, git.head_sha().expect("head"));
        assert_eq!(sha.len(), 40);
    }

    #[test]
    fn unchanged_tree_still_gets_a_new_commit() {
        let (dir, git) = repo();
        std::fs::write(dir.path().join("a.txt"), "one").expect("write");
        let first = git.commit("first").expect("commit");
        let second = git.commit("second").expect("commit");
        assert_ne!(first, second);
    }

    #[test]
    fn reset_restores_file_contents() {
        let (dir, git) = repo();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one").expect("write");
        let first = git.commit("first").expect("commit");
        std::fs::write(&file, "two").expect("write");
        git.commit("second").expect("commit");

        git.reset(&first).expect("reset");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "one");
        assert_eq!(git.head_sha().expect("head"), first);
    }

    #[test]
    fn reset_to_unknown_commit_fails() {
        let (dir, git) = repo();
        std::fs::write(dir.path().join("a.txt"), "one").expect("write");
        git.commit("first").expect("commit");
        let err = git.reset("0000000000000000000000000000000000000000").unwrap_err();
        assert!(err.to_string().contains("git reset"));
    }

    #[test]
    fn detects_repository() {
        let (_dir, git) = repo();
        assert!(git.is_repo());
        let bare = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(bare.path()).is_repo());
    }
}
