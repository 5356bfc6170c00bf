//! Build, classify, repair and evaluate loop for fixing failing Nix packages.
//!
//! A working tree holds one package expression under git. The loop builds it,
//! classifies the failure, asks an oracle for an edit, rebuilds, and keeps or
//! rolls back the edit depending on whether the build got further. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, log comparison,
//!   loop bookkeeping). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (subprocesses, git, filesystem,
//!   oracle calls). Behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`packaging`], [`progress`]) coordinate core logic
//! with I/O to implement the `run` command.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod packaging;
pub mod progress;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
