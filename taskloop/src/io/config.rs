//! Loop configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::agent::AgentKind;
use crate::io::progress_log::DEFAULT_TAIL_LINES;

/// Loop configuration (TOML).
///
/// Edited by humans; every field is optional in the file and falls back to
/// the defaults below. CLI flags and environment selectors are applied on top
/// by the binary before the struct reaches the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Upper bound on iterations per run.
    pub max_iterations: u32,

    /// Agent backend.
    pub agent: AgentKind,

    /// Shell command for the `custom` backend. `{prompt_file}` is replaced with
    /// the shell-quoted path of the prompt file.
    pub agent_command: Option<String>,

    /// Agent wall-clock timeout. Defaults depend on the backend.
    pub agent_timeout_secs: Option<u64>,

    /// Run every backend behind the synthetic terminal adapter.
    pub force_tty: bool,

    /// Lines of progress history handed to the agent.
    pub progress_tail_lines: usize,

    /// Pause after each successful iteration.
    pub iteration_pause_ms: u64,

    /// In-memory capture bound per agent output stream.
    pub transcript_limit_bytes: usize,

    pub verify: VerifyConfig,

    pub commit: CommitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Treat lint/format failures as blocking.
    pub lint_blocking: bool,
    pub check_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            lint_blocking: false,
            check_timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitConfig {
    /// Allow one final hook-bypassing commit attempt.
    pub allow_no_verify: bool,
    /// Attribution trailer appended to every commit message.
    pub trailer: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            allow_no_verify: false,
            trailer: "Automated-By: taskloop".to_string(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            agent: AgentKind::Claude,
            agent_command: None,
            agent_timeout_secs: None,
            force_tty: false,
            progress_tail_lines: DEFAULT_TAIL_LINES,
            iteration_pause_ms: 2_000,
            transcript_limit_bytes: 5_000_000,
            verify: VerifyConfig::default(),
            commit: CommitConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.agent_timeout_secs == Some(0) {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.progress_tail_lines == 0 {
            return Err(anyhow!("progress_tail_lines must be > 0"));
        }
        if self.transcript_limit_bytes == 0 {
            return Err(anyhow!("transcript_limit_bytes must be > 0"));
        }
        if self.verify.check_timeout_secs == 0 {
            return Err(anyhow!("verify.check_timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.commit.trailer.trim().is_empty() {
            return Err(anyhow!("commit.trailer must not be empty"));
        }
        if self.agent == AgentKind::Custom
            && self
                .agent_command
                .as_deref()
                .is_none_or(|cmd| cmd.trim().is_empty())
        {
            return Err(anyhow!("agent = \"custom\" requires a non-empty agent_command"));
        }
        Ok(())
    }

    /// Effective agent timeout: explicit value, else the backend default.
    pub fn agent_timeout(&self) -> Duration {
        self.agent_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.agent.default_timeout())
    }

    pub fn iteration_pause(&self) -> Duration {
        Duration::from_millis(self.iteration_pause_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.verify.check_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
