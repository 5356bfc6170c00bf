//! Shared deterministic types for the packaging loop.
//!
//! These types are the contract between the build invoker, the classifier, the
//! progress evaluator and the loop controller. They carry no I/O handles and
//! serialize to stable JSON for iteration logs.

use serde::{Deserialize, Serialize};

/// Number of tail lines kept by [`BuildError::truncated`] when no limit is given.
pub const DEFAULT_TRUNCATE_LINES: usize = 256;

/// Closed set of failure kinds assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The build description did not evaluate (syntax, missing attribute, ...).
    EvalError,
    /// The build description evaluated but the build itself failed.
    BuildError,
    /// A hash literal is not a valid SRI hash.
    InvalidHash,
    /// A fixed-output fetch produced a different hash than declared.
    HashMismatch,
    /// An upstream dependency failed to build; no log exists for the package itself.
    DependencyBuildError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EvalError => "EVAL_ERROR",
            ErrorKind::BuildError => "BUILD_ERROR",
            ErrorKind::InvalidHash => "INVALID_HASH",
            ErrorKind::HashMismatch => "HASH_MISMATCH",
            ErrorKind::DependencyBuildError => "DEPENDENCY_BUILD_ERROR",
        }
    }

    /// Hash errors get a narrow, single-value fix instead of a general rewrite.
    pub fn is_hash_error(self) -> bool {
        matches!(self, ErrorKind::InvalidHash | ErrorKind::HashMismatch)
    }
}

/// A classified build failure together with its raw captured text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub kind: ErrorKind,
    /// Full build log for [`ErrorKind::BuildError`], tool stderr otherwise.
    pub message: String,
}

/// One tail-anchored page of an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPage {
    /// 1-based page number; page 1 is the end of the log.
    pub page: usize,
    pub total_pages: usize,
    /// 1-based line number of the first line on this page.
    pub first_line: usize,
    /// 1-based line number of the last line on this page.
    pub last_line: usize,
    pub text: String,
}

impl ErrorPage {
    /// Render the page with a short header for the oracle.
    pub fn render(&self) -> String {
        format!(
            "[page {} of {}, lines {}-{}]\n{}",
            self.page, self.total_pages, self.first_line, self.last_line, self.text
        )
    }
}

impl BuildError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.message.lines().count()
    }

    /// Number of pages of `page_size` lines needed to show the whole message.
    ///
    /// Always at least 1 so an empty message still has a (blank) first page.
    pub fn total_pages(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 1;
        }
        self.line_count().div_ceil(page_size).max(1)
    }

    /// Return page `page` (1-based, counted from the tail) of `page_size` lines.
    pub fn page(&self, page: usize, page_size: usize) -> Option<ErrorPage> {
        if page == 0 || page_size == 0 {
            return None;
        }
        let total_pages = self.total_pages(page_size);
        if page > total_pages {
            return None;
        }
        let lines: Vec<&str> = self.message.lines().collect();
        let end = lines.len().saturating_sub((page - 1) * page_size);
        let start = end.saturating_sub(page_size);
        Some(ErrorPage {
            page,
            total_pages,
            first_line: start + 1,
            last_line: end,
            text: lines[start..end].join("\n"),
        })
    }

    /// Keep the last `max_lines` lines, noting how many were dropped.
    pub fn truncated(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.message.lines().collect();
        if lines.len() <= max_lines {
            return self.message.clone();
        }
        let omitted = lines.len() - max_lines;
        format!(
            "... ({omitted} lines omitted) ...\n\n{}",
            lines[omitted..].join("\n")
        )
    }
}

/// Outcome of one build invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    /// True when only the source fetch was checked, not the full package.
    pub source_check_only: bool,
    pub error: Option<BuildError>,
}

impl BuildResult {
    pub fn succeeded(source_check_only: bool) -> Self {
        Self {
            success: true,
            source_check_only,
            error: None,
        }
    }

    pub fn failed(source_check_only: bool, error: BuildError) -> Self {
        Self {
            success: false,
            source_check_only,
            error: Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|err| err.kind)
    }

    /// Only a full build that succeeded ends the loop.
    pub fn is_terminal_success(&self) -> bool {
        self.success && !self.source_check_only
    }
}

/// Judgement of a candidate build relative to the best one so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressVerdict {
    Progress,
    Regress,
    Stagnation,
    /// The log looks corrupted or truncated, so it cannot be compared.
    BrokenLogOutput,
}

impl ProgressVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressVerdict::Progress => "progress",
            ProgressVerdict::Regress => "regress",
            ProgressVerdict::Stagnation => "stagnation",
            ProgressVerdict::BrokenLogOutput => "broken_log_output",
        }
    }
}
