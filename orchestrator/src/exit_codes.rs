//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: bad config, I/O, git, or a merge that could not land.
pub const ERROR: i32 = 1;
/// Request refused without changing anything: unknown task, invalid state
/// for the action, rejected decision token, or unauthorized actor.
pub const REJECTED: i32 = 2;
