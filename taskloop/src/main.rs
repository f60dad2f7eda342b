//! `taskloop`: work through `.taskloop/tasks.json` with a coding agent, one
//! verified commit per task.
//!
//! Diagnostics go to stderr (see `RUST_LOG`); stdout carries only the final
//! completion or failure line.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::FalseyValueParser;
use tracing::debug;

use taskloop::controller::{IterationReport, LoopDeps, LoopOutcome, LoopStop, run_loop};
use taskloop::core::parser::MarkerLineParser;
use taskloop::error::LoopError;
use taskloop::exit_codes;
use taskloop::io::agent::{AgentKind, CliAgentInvoker};
use taskloop::io::commit::CommitOutcome;
use taskloop::io::config::{LoopConfig, load_config};
use taskloop::io::paths::LoopPaths;
use taskloop::io::verifier::PipelineVerifier;
use taskloop::logging;

#[derive(Parser, Debug)]
#[command(
    name = "taskloop",
    version,
    about = "Drive a coding agent through a task backlog, committing only verified work"
)]
struct Cli {
    /// Maximum iterations for this run (overrides `max_iterations`).
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,

    /// Working directory (must be inside a git work tree).
    #[arg(short = 'C', long = "dir", value_name = "DIR", default_value = ".")]
    dir: PathBuf,

    /// Config file (default: `<DIR>/.taskloop/config.toml`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Agent backend.
    #[arg(long, env = "TASKLOOP_AGENT", value_enum)]
    agent: Option<AgentKind>,

    /// Agent timeout in seconds (overrides `agent_timeout_secs`).
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// Allow one final hook-bypassing commit attempt.
    #[arg(long, env = "TASKLOOP_ALLOW_NO_VERIFY", value_parser = FalseyValueParser::new())]
    allow_no_verify: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(outcome) => report_outcome(&outcome),
        Err(err) => report_failure(&err),
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<LoopOutcome> {
    let root = cli
        .dir
        .canonicalize()
        .with_context(|| format!("resolve working directory {}", cli.dir.display()))?;
    let paths = LoopPaths::new(&root);
    let config_path = cli.config.clone().unwrap_or(paths.config_path);
    let mut config = load_config(&config_path)?;
    apply_overrides(&mut config, &cli);
    config
        .validate()
        .context("invalid configuration after command-line overrides")?;
    debug!(?config, "effective configuration");

    let agent = CliAgentInvoker::new(config.agent, config.agent_command.clone(), config.force_tty);
    let verifier = PipelineVerifier::new(
        config.verify.lint_blocking,
        config.check_timeout(),
        config.verify.output_limit_bytes,
    );

    run_loop(
        &root,
        &config,
        LoopDeps {
            agent: &agent,
            verifier: &verifier,
            parser: &MarkerLineParser,
        },
        print_iteration,
    )
}

fn apply_overrides(config: &mut LoopConfig, cli: &Cli) {
    if let Some(max) = cli.max_iterations {
        config.max_iterations = max;
    }
    if let Some(agent) = cli.agent {
        config.agent = agent;
    }
    if let Some(secs) = cli.timeout {
        config.agent_timeout_secs = Some(secs);
    }
    if cli.allow_no_verify {
        config.commit.allow_no_verify = true;
    }
}

fn print_iteration(report: &IterationReport) {
    let commit = match &report.commit {
        CommitOutcome::Committed {
            hash,
            bypassed_hooks,
        } => {
            let short = hash.get(..7).unwrap_or(hash);
            if *bypassed_hooks {
                format!("commit {short} (hooks bypassed)")
            } else {
                format!("commit {short}")
            }
        }
        CommitOutcome::NothingToCommit => "nothing to commit".to_string(),
    };
    eprintln!(
        "[iteration {}] {} complete, {}; {} remaining",
        report.iteration, report.task_id, commit, report.remaining
    );
}

fn report_outcome(outcome: &LoopOutcome) -> i32 {
    match &outcome.stop {
        LoopStop::AllComplete => println!(
            "taskloop: all tasks complete ({} completed this run)",
            outcome.completed.len()
        ),
        LoopStop::MaxIterationsReached { remaining } => println!(
            "taskloop: stopped after {} iterations with {remaining} task(s) remaining",
            outcome.iterations
        ),
    }
    outcome.exit_code()
}

fn report_failure(err: &anyhow::Error) -> i32 {
    println!("taskloop: failed: {err:#}");
    if let Some(hint) = err.downcast_ref::<LoopError>().and_then(LoopError::remediation) {
        eprintln!("hint: {hint}");
    }
    exit_codes::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "taskloop",
            "3",
            "--agent",
            "sandbox",
            "--timeout",
            "42",
            "--allow-no-verify",
        ])
        .expect("parse");
        let mut config = LoopConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.agent, AgentKind::Sandbox);
        assert_eq!(config.agent_timeout_secs, Some(42));
        assert!(config.commit.allow_no_verify);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        assert!(Cli::try_parse_from(["taskloop", "0"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
