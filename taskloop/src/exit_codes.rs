//! Stable exit codes for the `taskloop` binary.

/// Every task in the backlog is complete.
pub const OK: i32 = 0;
/// A stage failed, or the iteration bound was reached with tasks remaining.
pub const FAILURE: i32 = 1;
