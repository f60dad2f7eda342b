//! Autonomous task loop: hand a backlog to a coding agent one iteration at a
//! time and commit only work that passes verification.
//!
//! - **[`core`]**: Pure logic (completion-signal parsing, transcript
//!   classification, the ecosystem check table, data types). No I/O.
//! - **[`io`]**: Side-effecting adapters (task store, progress log, agent
//!   processes, verification, git).
//!
//! [`controller`] drives the two through the iteration state machine; the
//! `taskloop` binary wires configuration and logging around it.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
