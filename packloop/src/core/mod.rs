//! Deterministic, pure logic shared by the packaging loop.
//!
//! Core modules must be free of I/O side effects. They operate on captured
//! text and in-memory values and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod decision;
pub mod log_diff;
pub mod types;
