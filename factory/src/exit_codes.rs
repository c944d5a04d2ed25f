//! Stable exit codes for factory CLI commands.

/// Command succeeded, or `run` exhausted the job space or hit `--limit`.
pub const OK: i32 = 0;
/// Command failed due to invalid config/inputs, an unreachable lab host, or other errors.
pub const INVALID: i32 = 1;
/// `run` drained early after SIGINT/SIGTERM; the checkpoint is resumable.
pub const INTERRUPTED: i32 = 2;
