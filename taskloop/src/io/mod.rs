//! Side-effecting adapters: filesystem state, git, and child processes.

pub mod agent;
pub mod commit;
pub mod config;
pub mod git;
pub mod paths;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod task_store;
pub mod verifier;
