//! Stable exit codes for packloop CLI commands.

/// Command succeeded, or the package builds.
pub const OK: i32 = 0;
/// Command failed due to invalid layout, config or other errors.
pub const INVALID: i32 = 1;
/// `packloop run` or `packloop build` finished but the package still fails.
pub const FAILED: i32 = 2;
