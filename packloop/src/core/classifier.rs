//! Deterministic classification of failed builds.
//!
//! Classification is first-match-wins over the captured text:
//!
//! 1. invalid SRI hash signature (plan resolution only) -> [`ErrorKind::InvalidHash`]
//! 2. fixed-output hash mismatch signature -> [`ErrorKind::HashMismatch`]
//! 3. plan resolution failed -> [`ErrorKind::EvalError`]
//! 4. build failed and its log could not be fetched -> [`ErrorKind::DependencyBuildError`]
//! 5. otherwise -> [`ErrorKind::BuildError`] carrying the full build log

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{BuildError, ErrorKind};

pub const INVALID_HASH_SIGNATURE: &str = "invalid SRI hash";
pub const HASH_MISMATCH_SIGNATURE: &str = "hash mismatch in fixed-output derivation";
pub const SYNTAX_ERROR_MARKER: &str = "error: syntax error";

/// Replacement used when an invalid hash literal is swapped out mechanically.
pub const FAKE_HASH: &str = "lib.fakeHash";

static INVALID_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"hash '([A-Za-z0-9+/=:\-]+)'").unwrap());

/// What the build invoker observed before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEvidence<'a> {
    /// Resolving the build plan failed.
    Resolution { stderr: &'a str },
    /// The build ran and failed. `log` is `None` when the log could not be fetched.
    Build {
        stderr: &'a str,
        log: Option<&'a str>,
    },
}

/// Hash failures are recognizable from stderr alone, before any log exists.
pub fn hash_signature(text: &str) -> Option<ErrorKind> {
    if text.contains(INVALID_HASH_SIGNATURE) {
        return Some(ErrorKind::InvalidHash);
    }
    if text.contains(HASH_MISMATCH_SIGNATURE) {
        return Some(ErrorKind::HashMismatch);
    }
    None
}

/// Assign an [`ErrorKind`] and pick the message the oracle will see.
pub fn classify(evidence: &FailureEvidence<'_>) -> BuildError {
    match *evidence {
        FailureEvidence::Resolution { stderr } => {
            let kind = hash_signature(stderr).unwrap_or(ErrorKind::EvalError);
            BuildError::new(kind, stderr)
        }
        FailureEvidence::Build { stderr, log } => {
            // Invalid hashes surface during evaluation; a build only re-checks mismatches.
            if stderr.contains(HASH_MISMATCH_SIGNATURE) {
                return BuildError::new(ErrorKind::HashMismatch, stderr);
            }
            match log {
                Some(log) => BuildError::new(ErrorKind::BuildError, log),
                None => BuildError::new(ErrorKind::DependencyBuildError, stderr),
            }
        }
    }
}

/// An evaluation failure caused by unparsable code.
pub fn is_syntax_error(error: &BuildError) -> bool {
    error.kind == ErrorKind::EvalError && error.message.contains(SYNTAX_ERROR_MARKER)
}

/// Drop the evaluation trace preceding the syntax error marker.
pub fn syntax_error_excerpt(message: &str) -> &str {
    match message.find(SYNTAX_ERROR_MARKER) {
        Some(idx) => &message[idx..],
        None => message,
    }
}

/// Extract the rejected hash literal from an invalid hash message.
pub fn invalid_hash_literal(message: &str) -> Option<&str> {
    INVALID_HASH_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Replace the quoted literal holding the rejected hash with [`FAKE_HASH`].
///
/// Returns `None` when the hash cannot be located in `code`; the caller then
/// falls back to asking the oracle.
pub fn replace_invalid_hash(code: &str, message: &str) -> Option<String> {
    let literal = invalid_hash_literal(message)?;
    let pattern = format!(r#""[^"]*?{}[^"]*?""#, regex::escape(literal));
    let re = Regex::new(&pattern).ok()?;
    if !re.is_match(code) {
        return None;
    }
    Some(re.replace_all(code, FAKE_HASH).into_owned())
}
