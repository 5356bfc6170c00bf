//! Append-only history of attempted solutions with exact rollback.
//!
//! Every build of the working tree is committed and recorded here. The store
//! is the only component allowed to move the working tree between commits.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::types::BuildResult;
use crate::io::git::VersionControl;

/// Index of a solution's build result in the session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SolutionId(pub usize);

/// A code snapshot that was committed and built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Solution {
    pub code: String,
    pub commit_id: String,
    pub error_index: usize,
    pub result: BuildResult,
}

impl Solution {
    pub fn id(&self) -> SolutionId {
        SolutionId(self.error_index)
    }
}

/// History of build results plus the solutions that produced them.
///
/// Invariant: `history.len() - 1 == max(error_index)` whenever the store is non-empty.
#[derive(Debug)]
pub struct SolutionStore<V: VersionControl> {
    vcs: V,
    package_path: PathBuf,
    history: Vec<BuildResult>,
    solutions: Vec<Solution>,
}

impl<V: VersionControl> SolutionStore<V> {
    pub fn new(vcs: V, package_path: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            package_path: package_path.into(),
            history: Vec::new(),
            solutions: Vec::new(),
        }
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    /// Current contents of the file under edit.
    pub fn read_code(&self) -> Result<String> {
        fs::read_to_string(&self.package_path)
            .with_context(|| format!("read {}", self.package_path.display()))
    }

    /// Write `code` to the working tree and commit it. Returns the commit id.
    #[instrument(skip_all)]
    pub fn apply(&mut self, code: &str, message: &str) -> Result<String> {
        fs::write(&self.package_path, code)
            .with_context(|| format!("write {}", self.package_path.display()))?;
        let commit_id = self.vcs.commit(message).context("commit solution")?;
        debug!(commit_id = %commit_id, "applied code");
        Ok(commit_id)
    }

    /// Append a build result and the solution that produced it.
    pub fn record(&mut self, code: String, commit_id: String, result: BuildResult) -> SolutionId {
        self.history.push(result.clone());
        let error_index = self.history.len() - 1;
        self.solutions.push(Solution {
            code,
            commit_id,
            error_index,
            result,
        });
        debug!(error_index, "recorded solution");
        SolutionId(error_index)
    }

    pub fn get(&self, id: SolutionId) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.error_index == id.0)
    }

    /// Like [`Self::get`], for ids the caller holds and must still be present.
    pub fn expect_solution(&self, id: SolutionId) -> Result<&Solution> {
        self.get(id)
            .ok_or_else(|| anyhow!("solution {} is not in the store", id.0))
    }

    pub fn latest(&self) -> Option<&Solution> {
        self.solutions.last()
    }

    pub fn history(&self) -> &[BuildResult] {
        &self.history
    }

    pub fn solutions(&self) -> &[Solution] {
        &self.solutions
    }

    /// Restore the working tree to `id` and drop everything recorded after it.
    ///
    /// Afterwards the file under edit equals the solution's code byte for byte
    /// and the history ends with the solution's build result.
    #[instrument(skip_all, fields(error_index = id.0))]
    pub fn rollback(&mut self, id: SolutionId) -> Result<()> {
        let solution = self.expect_solution(id)?.clone();
        self.vcs
            .reset(&solution.commit_id)
            .with_context(|| format!("roll back to {}", solution.commit_id))?;

        self.history.truncate(solution.error_index + 1);
        self.solutions
            .retain(|s| s.error_index <= solution.error_index);

        let on_disk = self.read_code()?;
        if on_disk != solution.code {
            bail!(
                "rollback to {} left {} different from the recorded solution",
                solution.commit_id,
                self.package_path.display()
            );
        }
        info!(commit_id = %solution.commit_id, "rolled back");
        Ok(())
    }
}
