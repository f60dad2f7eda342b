//! Commit manager: stage-all plus a bounded commit retry policy.
//!
//! At most three `git commit` calls per task: the first attempt, one
//! re-staged retry when a hook mutated the tree, and one hook-bypassing
//! attempt when the operator allowed it.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::error::LoopError;
use crate::io::git::{CommitAttempt, Git};

const SUBJECT_MAX_CHARS: usize = 72;

/// Successful end state of [`CommitManager::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: String, bypassed_hooks: bool },
    /// Staging produced an empty diff.
    NothingToCommit,
}

#[derive(Debug, Clone)]
pub struct CommitManager {
    git: Git,
    trailer: String,
    allow_no_verify: bool,
}

impl CommitManager {
    pub fn new(git: Git, trailer: impl Into<String>, allow_no_verify: bool) -> Self {
        Self {
            git,
            trailer: trailer.into(),
            allow_no_verify,
        }
    }

    #[instrument(skip_all, fields(task_id))]
    pub fn commit(&self, task_id: &str, description: &str) -> Result<CommitOutcome> {
        self.git.add_all()?;
        if !self.git.has_staged_changes()? {
            info!("nothing to commit");
            return Ok(CommitOutcome::NothingToCommit);
        }
        let message = commit_message(task_id, description, &self.trailer);

        let mut last_stderr = match self.git.try_commit(&message, false)? {
            CommitAttempt::Committed => return self.committed(false),
            CommitAttempt::Rejected { stderr } => stderr,
        };

        if self.git.worktree_mutated()? {
            info!("hook modified the working tree, re-staging and retrying once");
            self.git.add_all()?;
            if !self.git.has_staged_changes()? {
                return Ok(CommitOutcome::NothingToCommit);
            }
            match self.git.try_commit(&message, false)? {
                CommitAttempt::Committed => return self.committed(false),
                CommitAttempt::Rejected { stderr } => last_stderr = stderr,
            }
        }

        if !self.allow_no_verify {
            return Err(LoopError::Commit(last_stderr).into());
        }

        warn!("retrying commit with hooks bypassed");
        self.git.add_all()?;
        match self.git.try_commit(&message, true)? {
            CommitAttempt::Committed => self.committed(true),
            CommitAttempt::Rejected { stderr } => Err(LoopError::Commit(stderr).into()),
        }
    }

    fn committed(&self, bypassed_hooks: bool) -> Result<CommitOutcome> {
        let hash = self.git.head_sha()?;
        info!(hash = %hash, bypassed_hooks, "committed");
        Ok(CommitOutcome::Committed {
            hash,
            bypassed_hooks,
        })
    }
}

/// `feat(<id>): <subject>`, the full description as body, then the trailer.
pub fn commit_message(task_id: &str, description: &str, trailer: &str) -> String {
    let description = description.trim();
    let first_line = description.lines().next().unwrap_or_default().trim();
    let subject: String = if first_line.chars().count() > SUBJECT_MAX_CHARS {
        let mut cut: String = first_line.chars().take(SUBJECT_MAX_CHARS - 3).collect();
        cut.push_str("...");
        cut
    } else {
        first_line.to_string()
    };

    let mut message = format!("feat({task_id}): {subject}\n\n");
    if !description.is_empty() {
        message.push_str(description);
        message.push_str("\n\n");
    }
    message.push_str(&format!("Task-Id: {task_id}\n{}\n", trailer.trim()));
    message
}
