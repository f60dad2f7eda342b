//! Shared deterministic types for the loop's core logic.
//!
//! These types define contracts between the controller and its collaborators.
//! They hold no I/O handles and serialize to stable formats.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One backlog entry in `.taskloop/tasks.json`.
///
/// Unknown fields are kept in `extra` so rewriting the store never drops data
/// written by whatever produced the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub passes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of a single verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    /// Failed and blocks the iteration.
    Fail,
    /// Failed but only logged.
    Warn,
}

/// Aggregate verification result for an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationOutcome {
    Pass,
    Fail,
}

impl VerificationOutcome {
    /// `Fail` iff any check failed blocking.
    pub fn aggregate(statuses: impl IntoIterator<Item = CheckStatus>) -> Self {
        if statuses.into_iter().any(|status| status == CheckStatus::Fail) {
            VerificationOutcome::Fail
        } else {
            VerificationOutcome::Pass
        }
    }
}

/// Status recorded in the progress log for an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Complete,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Complete => "complete",
            ProgressStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller states for one iteration, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GatherContext,
    InvokeAgent,
    ParseResult,
    ValidateTaskId,
    Verify,
    RecordCompletion,
    Commit,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::GatherContext => "gather-context",
            Stage::InvokeAgent => "invoke-agent",
            Stage::ParseResult => "parse-result",
            Stage::ValidateTaskId => "validate-task-id",
            Stage::Verify => "verify",
            Stage::RecordCompletion => "record-completion",
            Stage::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
