//! Typed failure taxonomy for the iteration controller.
//!
//! Side-effecting helpers return `anyhow::Result`; the variants below are raised
//! inside those errors so callers can `downcast_ref::<LoopError>()` to decide how
//! to report a halt.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every condition that halts a run.
#[derive(Debug, Error)]
pub enum LoopError {
    /// A required external dependency is missing (checked before spawning anything).
    #[error("environment not ready: {0}")]
    Environment(String),

    /// The task store is not valid JSON or violates its schema/invariants.
    #[error("task store {path} is malformed: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// `mark_complete` was called for an id the store does not contain.
    #[error("task '{0}' not found in task store")]
    TaskNotFound(String),

    #[error("agent did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The prompt would exceed the kernel's single-argument limit for a
    /// backend that receives it as an argument.
    #[error("prompt is {bytes} bytes; agent '{agent}' takes at most {limit} as an argument")]
    PromptTooLarge {
        agent: &'static str,
        bytes: usize,
        limit: usize,
    },

    #[error("agent reported an authentication failure")]
    Auth,

    #[error("agent hit a rate limit")]
    RateLimit,

    #[error("agent output contained no completion signal (transcript: {})", .transcript.display())]
    NoCompletionSignal { transcript: PathBuf },

    #[error("agent reported task '{0}' which is not in the task store")]
    UnknownTaskId(String),

    #[error("agent reported task '{0}' which is already complete")]
    AlreadyComplete(String),

    /// A blocking verification check failed.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The bounded commit retry policy was exhausted.
    #[error("commit failed: {0}")]
    Commit(String),
}

impl LoopError {
    /// Operator-facing guidance for errors that have a known fix.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            LoopError::Environment(_) => {
                Some("install the missing tool or choose another backend with --agent / TASKLOOP_AGENT")
            }
            LoopError::Timeout(_) => Some(
                "raise agent_timeout_secs in .taskloop/config.toml or pass --timeout; the partial transcript is in .taskloop/scratch/",
            ),
            LoopError::PromptTooLarge { .. } => Some(
                "lower progress_tail_lines in .taskloop/config.toml or trim .taskloop/progress.txt",
            ),
            LoopError::Auth => Some(
                "log the agent CLI in again (for example `claude /login` or `codex login`) and re-run",
            ),
            LoopError::RateLimit => {
                Some("wait for the provider limit to reset, then re-run; nothing was committed for this iteration")
            }
            LoopError::Commit(_) => Some(
                "inspect the pre-commit hook output; set TASKLOOP_ALLOW_NO_VERIFY=1 to allow a hook-bypassing commit",
            ),
            _ => None,
        }
    }
}
