//! Stable exit codes for the `bench` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid input, config, a rejected plan, or other errors.
pub const INVALID: i32 = 1;
/// Strict mode is active and a required external input is missing.
pub const STRICT_FATAL: i32 = 2;
/// The run completed but at least one worker reported a security violation.
pub const SECURITY_VIOLATION: i32 = 3;
