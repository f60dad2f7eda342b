//! Normalization and failure classification of captured agent transcripts.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::LoopError;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    // CSI sequences, OSC sequences (BEL or ST terminated), and lone two-byte escapes.
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ansi regex is valid")
});

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit_error",
    "usage limit reached",
    "too many requests",
];

const AUTH_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication_error",
    "please run /login",
    "not logged in",
    "oauth token has expired",
    "401 unauthorized",
];

/// Known failure classes detectable from transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptFailure {
    RateLimit,
    Auth,
}

impl TranscriptFailure {
    pub fn into_error(self) -> LoopError {
        match self {
            TranscriptFailure::RateLimit => LoopError::RateLimit,
            TranscriptFailure::Auth => LoopError::Auth,
        }
    }
}

/// Strip terminal control sequences and carriage returns added by the tty adapter.
pub fn normalize(raw: &str) -> String {
    ANSI_RE.replace_all(raw, "").replace('\r', "")
}

/// Look for rate-limit and authentication markers (case-insensitive).
///
/// Rate limits win when both appear: they are the more actionable report.
pub fn classify(output: &str) -> Option<TranscriptFailure> {
    let lower = output.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(TranscriptFailure::RateLimit);
    }
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(TranscriptFailure::Auth);
    }
    None
}

/// Classify only when the invocation looks unsuccessful.
///
/// A transcript that exited cleanly and carries a completion signal is trusted
/// even if the agent's prose happens to mention a marker phrase.
pub fn classify_unsuccessful(
    output: &str,
    exit_ok: bool,
    has_signal: bool,
) -> Option<TranscriptFailure> {
    if exit_ok && has_signal {
        return None;
    }
    classify(output)
}
