//! Completion-signal extraction from free-form agent output.
//!
//! The agent is an untrusted text generator: nothing here assumes the output is
//! well formed. The controller only sees the [`CompletionParser`] contract, so a
//! stricter protocol can replace the marker scrape without touching it.

use std::sync::LazyLock;

use regex::Regex;

/// Literal prefix the agent must print before the finished task id.
pub const COMPLETION_MARKER: &str = "COMPLETED_TASK_ID";

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bCOMPLETED_TASK_ID:[ \t]*([A-Za-z0-9_-]+)").expect("marker regex is valid")
});

/// Recover the id of the task the agent claims to have finished.
pub trait CompletionParser {
    fn parse(&self, raw_output: &str) -> Option<String>;
}

/// Scrapes the last `COMPLETED_TASK_ID: <token>` occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerLineParser;

impl CompletionParser for MarkerLineParser {
    fn parse(&self, raw_output: &str) -> Option<String> {
        MARKER_RE
            .captures_iter(raw_output)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// The exact line the prompt asks the agent to print.
pub fn completion_line(task_id: &str) -> String {
    format!("{COMPLETION_MARKER}: {task_id}")
}
