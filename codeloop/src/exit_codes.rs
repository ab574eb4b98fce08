//! Stable exit codes for `codeloop` CLI commands.

/// Command succeeded (source admitted, run judged successful).
pub const OK: i32 = 0;
/// Invalid config, unreadable input, or another infrastructure error.
pub const INVALID: i32 = 1;
/// `codeloop run` reached the retry ceiling without success.
pub const EXHAUSTED: i32 = 2;
/// The generation service stayed unavailable.
pub const UPSTREAM_UNAVAILABLE: i32 = 3;
/// `codeloop check` rejected the source, or `codeloop exec` judged the run failed.
pub const FAILED: i32 = 4;
/// The session was cancelled (Ctrl-C or end of input).
pub const CANCELLED: i32 = 5;
