//! Agent invocation.
//!
//! The [`AgentInvoker`] trait decouples the iteration controller from the
//! concrete agent CLI. [`CliAgentInvoker`] shells out to one of a fixed set of
//! backends; tests use scripted invokers that return canned transcripts
//! without spawning anything.

use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::transcript;
use crate::error::LoopError;
use crate::io::process::{Capture, command_exists, run_captured};

const PROMPT_PLACEHOLDER: &str = "{prompt_file}";
const SANDBOX_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
/// Linux `MAX_ARG_STRLEN` (128 KiB) less headroom for the flags around it.
pub const MAX_ARGUMENT_PROMPT_BYTES: usize = 128 * 1024 - 4 * 1024;

/// Supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// `claude` CLI on the host.
    Claude,
    /// `codex exec` on the host.
    Codex,
    /// `claude` inside a reusable `docker sandbox`.
    Sandbox,
    /// Operator-supplied shell command (`agent_command`).
    Custom,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Sandbox => "sandbox",
            Self::Custom => "custom",
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Sandbox => Duration::from_secs(600),
            _ => Duration::from_secs(300),
        }
    }

    /// Sandboxed claude refuses to run without a terminal.
    pub fn needs_tty(self) -> bool {
        matches!(self, Self::Sandbox)
    }

    /// Backends whose command line carries the prompt text as one argument.
    pub fn prompt_in_argument(self) -> bool {
        matches!(self, Self::Sandbox)
    }

    pub fn required_binaries(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude"],
            Self::Codex => &["codex"],
            Self::Sandbox => &["docker"],
            Self::Custom => &[],
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    /// Private directory for the prompt file; must not be committed.
    pub scratch_dir: PathBuf,
    /// Raw transcript destination (stdout and stderr, as emitted).
    pub transcript_path: PathBuf,
    pub timeout: Duration,
    /// In-memory capture bound per stream.
    pub output_limit_bytes: usize,
}

/// What the agent printed, normalized for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTranscript {
    /// Stdout then stderr with ANSI escapes and carriage returns removed.
    pub output: String,
    /// `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub transcript_path: PathBuf,
}

impl AgentTranscript {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Abstraction over agent execution backends.
pub trait AgentInvoker {
    /// Fail fast with [`LoopError::Environment`] when the backend cannot run.
    fn preflight(&self) -> Result<()>;

    /// Run the agent once. Exceeding `request.timeout` is [`LoopError::Timeout`].
    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript>;
}

/// Synthetic terminal adapter flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyFlavor {
    /// util-linux `script -qec CMD /dev/null`.
    UtilLinux,
    /// BSD/macOS `script -q /dev/null sh -c CMD`.
    Bsd,
}

impl TtyFlavor {
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            Self::Bsd
        } else {
            Self::UtilLinux
        }
    }
}

/// Invoker that spawns the selected agent CLI through `sh -c`.
#[derive(Debug, Clone)]
pub struct CliAgentInvoker {
    kind: AgentKind,
    custom_command: Option<String>,
    force_tty: bool,
}

impl CliAgentInvoker {
    pub fn new(kind: AgentKind, custom_command: Option<String>, force_tty: bool) -> Self {
        Self {
            kind,
            custom_command,
            force_tty,
        }
    }

    fn uses_tty(&self) -> bool {
        self.force_tty || self.kind.needs_tty()
    }

    fn shell_line(&self, prompt_path: &Path) -> Result<String> {
        let line = build_command_line(self.kind, self.custom_command.as_deref(), prompt_path)?;
        if self.uses_tty() {
            return Ok(wrap_with_tty(&line, TtyFlavor::host()));
        }
        Ok(line)
    }

    fn log_sandbox_state(&self, workdir: &Path) {
        let mut cmd = Command::new("docker");
        cmd.args(["sandbox", "ls"]);
        match run_captured(
            cmd,
            Capture {
                timeout: SANDBOX_CHECK_TIMEOUT,
                output_limit_bytes: 64 * 1024,
                tee_path: None,
            },
        ) {
            Ok(out) if out.status.success() => {
                let listing = String::from_utf8_lossy(&out.stdout);
                let workdir = workdir.display().to_string();
                if listing.lines().any(|l| l.contains(&workdir)) {
                    info!(workdir, "reusing existing sandbox");
                } else {
                    info!(workdir, "no sandbox for workdir yet, docker will create one");
                }
            }
            Ok(out) => {
                warn!(exit_code = ?out.status.code(), "docker sandbox ls failed");
            }
            Err(err) => warn!(err = %err, "docker sandbox ls could not run"),
        }
    }
}

impl AgentInvoker for CliAgentInvoker {
    #[instrument(skip_all, fields(agent = %self.kind))]
    fn preflight(&self) -> Result<()> {
        let mut required: Vec<&str> = self.kind.required_binaries().to_vec();
        if self.uses_tty() {
            required.push("script");
        }
        for binary in required {
            if !command_exists(binary) {
                return Err(LoopError::Environment(format!(
                    "`{binary}` not found on PATH (required by agent '{}')",
                    self.kind
                ))
                .into());
            }
        }

        if self.kind == AgentKind::Sandbox {
            let mut cmd = Command::new("docker");
            cmd.args(["sandbox", "version"]);
            let out = run_captured(
                cmd,
                Capture {
                    timeout: SANDBOX_CHECK_TIMEOUT,
                    output_limit_bytes: 64 * 1024,
                    tee_path: None,
                },
            )
            .context("check docker sandbox")?;
            if out.timed_out || !out.status.success() {
                return Err(LoopError::Environment(format!(
                    "`docker sandbox version` failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ))
                .into());
            }
        }

        debug!("agent preflight passed");
        Ok(())
    }

    #[instrument(skip_all, fields(agent = %self.kind, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript> {
        if self.kind.prompt_in_argument() && request.prompt.len() > MAX_ARGUMENT_PROMPT_BYTES {
            return Err(LoopError::PromptTooLarge {
                agent: self.kind.as_str(),
                bytes: request.prompt.len(),
                limit: MAX_ARGUMENT_PROMPT_BYTES,
            }
            .into());
        }

        fs::create_dir_all(&request.scratch_dir)
            .with_context(|| format!("create scratch dir {}", request.scratch_dir.display()))?;

        // Deleted on drop, after the child has exited.
        let mut prompt_file = tempfile::Builder::new()
            .prefix("prompt-")
            .suffix(".md")
            .tempfile_in(&request.scratch_dir)
            .with_context(|| {
                format!("create prompt file in {}", request.scratch_dir.display())
            })?;
        prompt_file
            .write_all(request.prompt.as_bytes())
            .and_then(|()| prompt_file.flush())
            .context("write prompt file")?;

        if self.kind == AgentKind::Sandbox {
            self.log_sandbox_state(&request.workdir);
        }

        let line = self.shell_line(prompt_file.path())?;
        debug!(command = %line, "agent command line");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&line).current_dir(&request.workdir);

        info!(workdir = %request.workdir.display(), "starting agent");
        let output = run_captured(
            cmd,
            Capture {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                tee_path: Some(&request.transcript_path),
            },
        )
        .with_context(|| format!("run agent '{}'", self.kind))?;

        if output.timed_out {
            warn!(
                transcript = %request.transcript_path.display(),
                "agent timed out"
            );
            return Err(LoopError::Timeout(request.timeout).into());
        }

        let mut raw = output.combined_lossy();
        raw.push_str(&output.truncation_notice("agent"));
        let exit_code = output.status.code();
        info!(?exit_code, "agent finished");
        Ok(AgentTranscript {
            output: transcript::normalize(&raw),
            exit_code,
            transcript_path: request.transcript_path.clone(),
        })
    }
}

/// Shell command line for `kind`, reading the prompt from `prompt_path`.
///
/// The prompt never appears in the command line itself; only its quoted path
/// does. Host backends read it on stdin. The sandbox expands it into a single
/// argument, which [`MAX_ARGUMENT_PROMPT_BYTES`] bounds.
pub fn build_command_line(
    kind: AgentKind,
    custom_command: Option<&str>,
    prompt_path: &Path,
) -> Result<String> {
    let quoted = shell_escape::escape(prompt_path.to_string_lossy());
    let line = match kind {
        AgentKind::Claude => format!("claude --dangerously-skip-permissions -p < {quoted}"),
        AgentKind::Codex => format!(
            "codex exec --dangerously-bypass-approvals-and-sandbox --skip-git-repo-check - < {quoted}"
        ),
        AgentKind::Sandbox => format!(
            "docker sandbox run claude --dangerously-skip-permissions -p \"$(cat {quoted})\""
        ),
        AgentKind::Custom => {
            let template = custom_command
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    LoopError::Environment("agent 'custom' has no agent_command".to_string())
                })?;
            if template.contains(PROMPT_PLACEHOLDER) {
                template.replace(PROMPT_PLACEHOLDER, &quoted)
            } else {
                format!("{template} < {quoted}")
            }
        }
    };
    Ok(line)
}

/// Run `line` under `script` so the agent sees a terminal.
pub fn wrap_with_tty(line: &str, flavor: TtyFlavor) -> String {
    let quoted = shell_escape::escape(Cow::Borrowed(line));
    match flavor {
        TtyFlavor::UtilLinux => format!("script -qec {quoted} /dev/null"),
        TtyFlavor::Bsd => format!("script -q /dev/null sh -c {quoted}"),
    }
}
