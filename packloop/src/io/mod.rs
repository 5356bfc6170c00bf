//! Side-effecting operations: subprocesses, git, filesystem, oracle calls.

pub mod build;
pub mod config;
pub mod format;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod solution_store;
