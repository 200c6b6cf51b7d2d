//! Stable exit codes for coder CLI commands.

/// Command succeeded, or the task finished (including "handled without a plan").
pub const OK: i32 = 0;
/// Invalid arguments, config or task id, or an unexpected internal error.
pub const INVALID: i32 = 1;
/// The task ended in `failed`.
pub const FAILED: i32 = 2;
/// The user declined to start, resume or continue the task.
pub const CANCELLED: i32 = 3;
