//! Test doubles and fixtures shared by unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::transcript;
use crate::core::types::{CheckStatus, Task, VerificationOutcome};
use crate::io::agent::{AgentInvoker, AgentRequest, AgentTranscript};
use crate::io::paths::LoopPaths;
use crate::io::task_store::TaskStore;
use crate::io::verifier::{CheckResult, Strategy, VerificationReport, Verifier, VerifyRequest};

/// One canned agent response.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    output: String,
    exit_code: Option<i32>,
    writes: Vec<(String, String)>,
}

impl ScriptedReply {
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Write `contents` to `relative` (under the workdir) as the "work" done.
    pub fn writing(mut self, relative: &str, contents: &str) -> Self {
        self.writes.push((relative.to_string(), contents.to_string()));
        self
    }
}

/// Agent that replays [`ScriptedReply`] values in order.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: RefCell<VecDeque<ScriptedReply>>,
    invocations: Cell<usize>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn reply(output: &str) -> ScriptedReply {
        ScriptedReply {
            output: output.to_string(),
            exit_code: Some(0),
            writes: Vec::new(),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl AgentInvoker for ScriptedAgent {
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript> {
        self.invocations.set(self.invocations.get() + 1);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no reply left"))?;

        for (relative, contents) in &reply.writes {
            let path = request.workdir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(parent) = request.transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.transcript_path, &reply.output)?;

        Ok(AgentTranscript {
            output: transcript::normalize(&reply.output),
            exit_code: reply.exit_code,
            transcript_path: request.transcript_path.clone(),
        })
    }
}

/// Verifier returning a fixed report.
#[derive(Debug)]
pub struct ScriptedVerifier {
    report: VerificationReport,
    calls: Cell<usize>,
}

impl ScriptedVerifier {
    pub fn passing() -> Self {
        Self::with_status(CheckStatus::Pass, None)
    }

    pub fn failing(output_tail: &str) -> Self {
        Self::with_status(CheckStatus::Fail, Some(output_tail.to_string()))
    }

    fn with_status(status: CheckStatus, failure_tail: Option<String>) -> Self {
        Self {
            report: VerificationReport {
                outcome: VerificationOutcome::aggregate([status]),
                strategy: Strategy::CustomHook,
                checks: vec![CheckResult {
                    name: "custom hook".to_string(),
                    command: ".taskloop/verify".to_string(),
                    status,
                    exit_code: Some(if status == CheckStatus::Pass { 0 } else { 1 }),
                    timed_out: false,
                }],
                failure_tail,
            },
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> Result<VerificationReport> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.report.clone())
    }
}

/// Throwaway git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "loop@example.com"])?;
        repo.git(&["config", "user.name", "Loop Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# fixture\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    /// Repo whose committed `.taskloop/tasks.json` holds `(id, description, passes)`.
    pub fn with_tasks(tasks: &[(&str, &str, bool)]) -> Result<Self> {
        let repo = Self::new()?;
        let json: Vec<serde_json::Value> = tasks
            .iter()
            .map(|(id, description, passes)| {
                serde_json::json!({"id": id, "description": description, "passes": passes})
            })
            .collect();
        let mut body = serde_json::to_string_pretty(&json)?;
        body.push('\n');
        repo.write(".taskloop/tasks.json", &body)?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "seed tasks"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> LoopPaths {
        LoopPaths::new(self.root())
    }

    /// Run git and return stdout; a non-zero exit is an error.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim().parse().context("parse commit count")
    }

    pub fn tasks(&self) -> Result<Vec<Task>> {
        TaskStore::new(self.paths().tasks_path).load()
    }

    pub fn progress(&self) -> Result<String> {
        let path = self.paths().progress_path;
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Install an executable git hook.
    #[cfg(unix)]
    pub fn install_hook(&self, name: &str, script: &str) -> Result<()> {
        self.install_executable(&format!(".git/hooks/{name}"), script)
    }

    /// Install the custom verification hook at `.taskloop/verify`.
    #[cfg(unix)]
    pub fn install_verify_hook(&self, script: &str) -> Result<()> {
        self.install_executable(".taskloop/verify", script)
    }

    #[cfg(unix)]
    fn install_executable(&self, relative: &str, script: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        self.write(relative, script)?;
        let path = self.root().join(relative);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))
    }
}
