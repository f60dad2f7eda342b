//! Git adapter.
//!
//! The loop only ever stages and commits; it never creates branches, tags or
//! pushes. Everything goes through `git` subprocess calls in the working tree.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    /// True when the working tree holds changes the index does not.
    pub fn has_unstaged_change(&self) -> bool {
        self.code == "??" || self.code.chars().nth(1).is_some_and(|y| y != ' ')
    }
}

/// Result of a single `git commit` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitAttempt {
    Committed,
    Rejected { stderr: String },
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if the workdir is inside a git work tree.
    pub fn is_work_tree(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if the working tree differs from the index (e.g. a hook rewrote files).
    pub fn worktree_mutated(&self) -> Result<bool> {
        let mutated: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(StatusEntry::has_unstaged_change)
            .collect();
        if !mutated.is_empty() {
            debug!(count = mutated.len(), "unstaged changes present");
        }
        Ok(!mutated.is_empty())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Attempt one commit of the index. A rejected commit (hook failure,
    /// nothing to commit) is returned, not raised.
    #[instrument(skip_all, fields(no_verify))]
    pub fn try_commit(&self, message: &str, no_verify: bool) -> Result<CommitAttempt> {
        let mut args = vec!["commit", "-m", message];
        if no_verify {
            args.push("--no-verify");
        }
        let out = self.run(&args)?;
        if out.status.success() {
            debug!("commit created");
            return Ok(CommitAttempt::Committed);
        }
        let mut stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&out.stdout);
        if stderr.is_empty() {
            stderr = stdout.trim().to_string();
        }
        warn!(exit_code = ?out.status.code(), "commit rejected");
        Ok(CommitAttempt::Rejected { stderr })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
