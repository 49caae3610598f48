//! Stable exit codes for the `probescout` CLI.

/// Command succeeded; a scan finished (goal met, oracle done, or budget reached).
pub const OK: i32 = 0;
/// Invalid input, config or pre-flight failure, or any other error.
pub const INVALID: i32 = 1;
/// The scan was aborted (repeated invalid intents or a stop request).
pub const ABORTED: i32 = 2;
