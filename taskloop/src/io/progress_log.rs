//! Append-only progress log (`.taskloop/progress.txt`).
//!
//! Human-readable record of every iteration. Nothing here ever rewrites prior
//! content; the controller is the only writer.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::core::types::ProgressStatus;

/// Returned by [`ProgressLog::tail`] when there is nothing to show.
pub const NO_HISTORY: &str = "No history yet.";

/// Default number of lines handed to the agent.
pub const DEFAULT_TAIL_LINES: usize = 250;

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `n` lines, or [`NO_HISTORY`] if the log is absent or blank.
    pub fn tail(&self, n: usize) -> Result<String> {
        if !self.path.exists() {
            return Ok(NO_HISTORY.to_string());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read progress log {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(NO_HISTORY.to_string());
        }
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].join("\n"))
    }

    pub fn append_iteration_header(
        &self,
        iteration: u32,
        timestamp: DateTime<Utc>,
        task_id: &str,
        description: &str,
    ) -> Result<()> {
        let mut entry = format!(
            "\n## Iteration {iteration} - {}\nTask: {task_id}\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        for (i, line) in description.lines().enumerate() {
            let prefix = if i == 0 { "Description: " } else { "  " };
            entry.push_str(prefix);
            entry.push_str(line);
            entry.push('\n');
        }
        self.append(&entry)
    }

    pub fn append_result(&self, status: ProgressStatus, detail: &str) -> Result<()> {
        self.append(&format!("Status: {status}\n{}\n", indent_detail(detail)))
    }

    /// Failure line for a fatal stage that happened before any header was written.
    pub fn append_failure(
        &self,
        iteration: u32,
        timestamp: DateTime<Utc>,
        detail: &str,
    ) -> Result<()> {
        self.append(&format!(
            "\n## Iteration {iteration} - {}\nStatus: {}\n{}\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ProgressStatus::Failed,
            indent_detail(detail)
        ))
    }

    fn append(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("append progress log {}", self.path.display()))?;
        debug!(bytes = text.len(), "progress log appended");
        Ok(())
    }
}

fn indent_detail(detail: &str) -> String {
    let body = detail.trim();
    if body.is_empty() {
        return "Detail: -".to_string();
    }
    let mut out = String::from("Detail:");
    for line in body.lines() {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}
