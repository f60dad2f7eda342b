//! Verification pipeline run after the agent claims a task.
//!
//! Strategies are tried in order and the first applicable one wins:
//! 1. an executable custom hook at `.taskloop/verify` (exit code only),
//! 2. the check table of every ecosystem whose marker file is present.
//!
//! A blocking failure short-circuits the remaining checks.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::checks::{CheckSpec, Ecosystem, Requirement, default_ecosystems};
use crate::core::types::{CheckStatus, VerificationOutcome};
use crate::io::process::{Capture, CommandOutput, command_exists, run_captured};

const FAILURE_TAIL_LINES: usize = 40;
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub hook_path: PathBuf,
    /// Every check's output is written here.
    pub log_path: PathBuf,
}

/// Which strategy produced the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    CustomHook,
    AutoDetected { ecosystems: Vec<String> },
    /// No hook, and no check applied.
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    pub strategy: Strategy,
    pub checks: Vec<CheckResult>,
    /// Last lines of the blocking failure's output, if any.
    pub failure_tail: Option<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.outcome == VerificationOutcome::Pass
    }

    /// One-line description for logs and the progress file.
    pub fn summary(&self) -> String {
        let describe = |c: &CheckResult| {
            let status = match c.status {
                CheckStatus::Pass => "pass",
                CheckStatus::Fail => "FAIL",
                CheckStatus::Warn => "warn",
            };
            format!("{} {status}", c.name)
        };
        match &self.strategy {
            Strategy::Nothing => "no verification checks found; nothing was verified".to_string(),
            Strategy::CustomHook => format!(
                "custom hook: {}",
                self.checks.first().map_or("?".to_string(), describe)
            ),
            Strategy::AutoDetected { ecosystems } => format!(
                "{} [{}]",
                ecosystems.join("+"),
                self.checks.iter().map(describe).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerificationReport>;
}

/// Hook-or-table verifier that runs real processes.
#[derive(Debug, Clone)]
pub struct PipelineVerifier {
    ecosystems: Vec<Ecosystem>,
    lint_blocking: bool,
    check_timeout: Duration,
    output_limit_bytes: usize,
}

impl PipelineVerifier {
    pub fn new(lint_blocking: bool, check_timeout: Duration, output_limit_bytes: usize) -> Self {
        Self::with_ecosystems(
            default_ecosystems(),
            lint_blocking,
            check_timeout,
            output_limit_bytes,
        )
    }

    pub fn with_ecosystems(
        ecosystems: Vec<Ecosystem>,
        lint_blocking: bool,
        check_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            ecosystems,
            lint_blocking,
            check_timeout,
            output_limit_bytes,
        }
    }

    fn run_hook(&self, request: &VerifyRequest, log: &mut File) -> Result<VerificationReport> {
        let command = request.hook_path.display().to_string();
        info!(hook = %command, "running custom verification hook");
        let mut cmd = Command::new(&request.hook_path);
        cmd.current_dir(&request.workdir);
        let (result, output) = self.run_one("custom hook", &command, cmd, true, log)?;
        let outcome = VerificationOutcome::aggregate([result.status]);
        Ok(VerificationReport {
            outcome,
            strategy: Strategy::CustomHook,
            failure_tail: (outcome == VerificationOutcome::Fail).then(|| tail(&output)),
            checks: vec![result],
        })
    }

    fn run_table(&self, request: &VerifyRequest, log: &mut File) -> Result<VerificationReport> {
        let matched: Vec<&Ecosystem> = self
            .ecosystems
            .iter()
            .filter(|eco| eco.markers.iter().any(|m| request.workdir.join(m).exists()))
            .collect();
        let mut checks = Vec::new();
        let mut failure_tail = None;

        'ecosystems: for eco in &matched {
            debug!(ecosystem = %eco.name, "ecosystem detected");
            for spec in &eco.checks {
                if !requirement_met(&spec.requires, &request.workdir) {
                    debug!(check = %spec.name, "check not applicable, skipping");
                    continue;
                }
                let blocking = spec.kind.is_blocking(self.lint_blocking);
                let (result, output) = self.run_one(
                    &spec.name,
                    &spec.display_command(),
                    command_for(spec, request),
                    blocking,
                    log,
                )?;
                let failed = result.status == CheckStatus::Fail;
                checks.push(result);
                if failed {
                    failure_tail = Some(tail(&output));
                    warn!(check = %spec.name, "blocking check failed, skipping remaining checks");
                    break 'ecosystems;
                }
            }
        }

        if checks.is_empty() {
            warn!("no verification checks found; nothing was verified");
            return Ok(VerificationReport {
                outcome: VerificationOutcome::Pass,
                strategy: Strategy::Nothing,
                checks,
                failure_tail: None,
            });
        }

        Ok(VerificationReport {
            outcome: VerificationOutcome::aggregate(checks.iter().map(|c| c.status)),
            strategy: Strategy::AutoDetected {
                ecosystems: matched.iter().map(|e| e.name.clone()).collect(),
            },
            checks,
            failure_tail,
        })
    }

    /// Run one check, append its output to the log, and classify it.
    fn run_one(
        &self,
        name: &str,
        command: &str,
        cmd: Command,
        blocking: bool,
        log: &mut File,
    ) -> Result<(CheckResult, String)> {
        debug!(check = name, command, blocking, "running check");
        let captured = run_captured(
            cmd,
            Capture {
                timeout: self.check_timeout,
                output_limit_bytes: self.output_limit_bytes,
                tee_path: None,
            },
        );
        let (success, exit_code, timed_out, output) = match captured {
            Ok(out) => (
                out.status.success() && !out.timed_out,
                out.status.code(),
                out.timed_out,
                render_output(&out),
            ),
            // A check whose program cannot start counts as a failed check.
            Err(err) => (false, None, false, format!("failed to start: {err:#}\n")),
        };

        let status = match (success, blocking) {
            (true, _) => CheckStatus::Pass,
            (false, true) => CheckStatus::Fail,
            (false, false) => CheckStatus::Warn,
        };
        match status {
            CheckStatus::Pass => info!(check = name, "check passed"),
            CheckStatus::Warn => warn!(check = name, ?exit_code, "non-blocking check failed"),
            CheckStatus::Fail => warn!(check = name, ?exit_code, timed_out, "check failed"),
        }

        writeln!(log, "=== {name}: {command} ===")
            .and_then(|()| log.write_all(output.as_bytes()))
            .and_then(|()| {
                writeln!(
                    log,
                    "[exit: {}{}] [{}]\n",
                    exit_code.map_or("none".to_string(), |c| c.to_string()),
                    if timed_out { ", timed out" } else { "" },
                    status_label(status)
                )
            })
            .context("write verification log")?;

        Ok((
            CheckResult {
                name: name.to_string(),
                command: command.to_string(),
                status,
                exit_code,
                timed_out,
            },
            output,
        ))
    }
}

impl Verifier for PipelineVerifier {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerificationReport> {
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create verification log dir {}", parent.display()))?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&request.log_path)
            .with_context(|| format!("open verification log {}", request.log_path.display()))?;

        let report = if is_executable(&request.hook_path) {
            self.run_hook(request, &mut log)?
        } else {
            if request.hook_path.exists() {
                warn!(
                    hook = %request.hook_path.display(),
                    "verification hook exists but is not executable; using auto-detected checks"
                );
            }
            self.run_table(request, &mut log)?
        };

        info!(outcome = ?report.outcome, summary = %report.summary(), "verification finished");
        Ok(report)
    }
}

fn command_for(spec: &CheckSpec, request: &VerifyRequest) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).current_dir(&request.workdir);
    cmd
}

fn requirement_met(requirement: &Requirement, workdir: &Path) -> bool {
    match requirement {
        Requirement::Always => true,
        Requirement::OnPath(tool) => command_exists(tool),
        Requirement::NpmScript(script) => npm_script_declared(workdir, script),
    }
}

fn npm_script_declared(workdir: &Path, script: &str) -> bool {
    let Ok(contents) = fs::read_to_string(workdir.join("package.json")) else {
        return false;
    };
    let Ok(manifest) = serde_json::from_str::<Value>(&contents) else {
        warn!("package.json is not valid json; skipping npm checks");
        return false;
    };
    match manifest.pointer(&format!("/scripts/{script}")) {
        Some(Value::String(body)) => !(script == "test" && body.contains(NPM_PLACEHOLDER_TEST)),
        _ => false,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn render_output(out: &CommandOutput) -> String {
    let mut text = out.combined_lossy();
    text.push_str(&out.truncation_notice("check"));
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    lines[start..].join("\n")
}

fn status_label(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "pass",
        CheckStatus::Fail => "fail",
        CheckStatus::Warn => "warn",
    }
}
