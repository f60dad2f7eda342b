//! The iteration controller.
//!
//! One iteration walks the stages of [`Stage`] in order:
//! gather context, invoke the agent, parse its completion signal, validate the
//! claimed id, verify, record completion, commit. Any stage failure halts the
//! whole run after a failure entry is appended to the progress log.

use std::path::Path;
use std::thread;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::parser::CompletionParser;
use crate::core::transcript;
use crate::core::types::{ProgressStatus, Stage, Task};
use crate::error::LoopError;
use crate::io::agent::{AgentInvoker, AgentRequest};
use crate::io::commit::{CommitManager, CommitOutcome};
use crate::io::config::LoopConfig;
use crate::io::git::Git;
use crate::io::paths::{LoopPaths, ensure_scratch_ignored};
use crate::io::progress_log::ProgressLog;
use crate::io::prompt::{PromptInputs, render_iteration_prompt};
use crate::io::task_store::TaskStore;
use crate::io::verifier::{VerificationReport, Verifier, VerifyRequest};

/// Why the loop stopped without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No incomplete tasks remain.
    AllComplete,
    /// The iteration bound was reached with tasks still open.
    MaxIterationsReached { remaining: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Iterations that ran to completion.
    pub iterations: u32,
    /// Task ids completed during this run, in order.
    pub completed: Vec<String>,
    pub stop: LoopStop,
}

impl LoopOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.stop {
            LoopStop::AllComplete => crate::exit_codes::OK,
            LoopStop::MaxIterationsReached { .. } => crate::exit_codes::FAILURE,
        }
    }
}

/// Summary of one successful iteration, handed to the observer.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub task_id: String,
    pub verification: VerificationReport,
    pub commit: CommitOutcome,
    /// Tasks still open after this iteration.
    pub remaining: usize,
}

/// A stage failure plus what is known about the task at that point.
struct StageFailure {
    stage: Stage,
    task: Option<Task>,
    detail: Option<String>,
    error: anyhow::Error,
}

impl StageFailure {
    fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> StageFailure {
        move |error| StageFailure {
            stage,
            task: None,
            detail: None,
            error,
        }
    }
}

/// Collaborators the controller drives. Injected so tests can script them.
pub struct LoopDeps<'a, A, V, P> {
    pub agent: &'a A,
    pub verifier: &'a V,
    pub parser: &'a P,
}

/// Run iterations until the backlog is empty, the bound is reached, or a
/// stage fails.
///
/// A stage failure is returned as an error whose source is a [`LoopError`]
/// when the failure has a typed cause. `on_iteration` is called after every
/// successful iteration.
#[instrument(skip_all, fields(root = %root.display(), max_iterations = config.max_iterations))]
pub fn run_loop<A, V, P, F>(
    root: &Path,
    config: &LoopConfig,
    deps: LoopDeps<'_, A, V, P>,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    A: AgentInvoker,
    V: Verifier,
    P: CompletionParser,
    F: FnMut(&IterationReport),
{
    let paths = LoopPaths::new(root);
    let store = TaskStore::new(&paths.tasks_path);
    preflight(&paths, &store, deps.agent)?;
    ensure_scratch_ignored(&paths)?;

    let run_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    info!(run_id = %run_id, agent_timeout_secs = config.agent_timeout().as_secs(), "starting run");

    let ctx = Iteration {
        paths: &paths,
        config,
        run_id: &run_id,
        store: &store,
        progress: ProgressLog::new(&paths.progress_path),
        committer: CommitManager::new(
            Git::new(root),
            config.commit.trailer.clone(),
            config.commit.allow_no_verify,
        ),
    };

    let mut completed = Vec::new();
    for iteration in 1..=config.max_iterations {
        let incomplete = match store.list_incomplete() {
            Ok(tasks) => tasks,
            Err(err) => {
                return Err(ctx.halt(iteration, StageFailure::at(Stage::GatherContext)(err)));
            }
        };
        if incomplete.is_empty() {
            info!(iteration, "no incomplete tasks left");
            return Ok(LoopOutcome {
                run_id,
                iterations: iteration - 1,
                completed,
                stop: LoopStop::AllComplete,
            });
        }
        if iteration > 1 {
            thread::sleep(config.iteration_pause());
        }

        match ctx.run(iteration, &incomplete, &deps) {
            Ok(report) => {
                info!(
                    iteration,
                    task_id = %report.task_id,
                    remaining = report.remaining,
                    "iteration complete"
                );
                completed.push(report.task_id.clone());
                on_iteration(&report);
            }
            Err(failure) => return Err(ctx.halt(iteration, failure)),
        }
    }

    let remaining = store.count()?;
    let stop = if remaining == 0 {
        LoopStop::AllComplete
    } else {
        warn!(remaining, "max iterations reached with tasks remaining");
        LoopStop::MaxIterationsReached { remaining }
    };
    Ok(LoopOutcome {
        run_id,
        iterations: config.max_iterations,
        completed,
        stop,
    })
}

/// Environment checks that run before anything is spawned or written.
fn preflight<A: AgentInvoker>(paths: &LoopPaths, store: &TaskStore, agent: &A) -> Result<()> {
    if !Git::new(&paths.root).is_work_tree()? {
        return Err(LoopError::Environment(format!(
            "{} is not inside a git work tree",
            paths.root.display()
        ))
        .into());
    }
    if !store.path().exists() {
        return Err(LoopError::Environment(format!(
            "task store {} does not exist",
            store.path().display()
        ))
        .into());
    }
    let tasks = store.load()?;
    debug!(tasks = tasks.len(), "task store parsed");
    agent.preflight()
}

/// Per-run state shared by every iteration.
struct Iteration<'a> {
    paths: &'a LoopPaths,
    config: &'a LoopConfig,
    run_id: &'a str,
    store: &'a TaskStore,
    progress: ProgressLog,
    committer: CommitManager,
}

impl Iteration<'_> {
    #[instrument(skip_all, fields(iteration))]
    fn run<A, V, P>(
        &self,
        iteration: u32,
        incomplete: &[Task],
        deps: &LoopDeps<'_, A, V, P>,
    ) -> Result<IterationReport, StageFailure>
    where
        A: AgentInvoker,
        V: Verifier,
        P: CompletionParser,
    {
        // Gather context.
        let prompt = self
            .compose_prompt(incomplete)
            .map_err(StageFailure::at(Stage::GatherContext))?;

        // Invoke agent.
        let transcript_path = self.paths.transcript_path(self.run_id, iteration);
        let transcript = deps
            .agent
            .invoke(&AgentRequest {
                workdir: self.paths.root.clone(),
                prompt,
                scratch_dir: self.paths.run_dir(self.run_id),
                transcript_path: transcript_path.clone(),
                timeout: self.config.agent_timeout(),
                output_limit_bytes: self.config.transcript_limit_bytes,
            })
            .map_err(StageFailure::at(Stage::InvokeAgent))?;

        // Parse result.
        let claimed = deps.parser.parse(&transcript.output);
        if let Some(failure) = transcript::classify_unsuccessful(
            &transcript.output,
            transcript.success(),
            claimed.is_some(),
        ) {
            return Err(StageFailure::at(Stage::InvokeAgent)(
                failure.into_error().into(),
            ));
        }
        let Some(task_id) = claimed else {
            return Err(StageFailure::at(Stage::ParseResult)(
                LoopError::NoCompletionSignal {
                    transcript: transcript_path,
                }
                .into(),
            ));
        };
        if !transcript.success() {
            warn!(
                exit_code = ?transcript.exit_code,
                task_id = %task_id,
                "agent exited unsuccessfully but reported completion; verification decides"
            );
        }

        // Validate task id.
        let task = self
            .validate_claim(&task_id)
            .map_err(StageFailure::at(Stage::ValidateTaskId))?;
        info!(task_id = %task.id, "agent reported completion");

        // Verify.
        let verify_log = self.paths.verify_log_path(self.run_id, iteration);
        let verification = match deps.verifier.verify(&VerifyRequest {
            workdir: self.paths.root.clone(),
            hook_path: self.paths.verify_hook_path.clone(),
            log_path: verify_log.clone(),
        }) {
            Ok(report) => report,
            Err(error) => {
                return Err(StageFailure {
                    task: Some(task),
                    ..StageFailure::at(Stage::Verify)(error)
                });
            }
        };
        if !verification.passed() {
            let mut detail = format!("verification failed: {}", verification.summary());
            if let Some(tail) = &verification.failure_tail {
                detail.push('\n');
                detail.push_str(tail);
            }
            detail.push_str(&format!(
                "\nverification log: {}",
                self.paths.relative(&verify_log).display()
            ));
            return Err(StageFailure {
                stage: Stage::Verify,
                task: Some(task),
                detail: Some(detail),
                error: LoopError::Verification(verification.summary()).into(),
            });
        }

        // Record completion.
        if let Err(error) =
            self.record_completion(iteration, &task, &verification, &transcript_path)
        {
            return Err(StageFailure {
                task: Some(task),
                ..StageFailure::at(Stage::RecordCompletion)(error)
            });
        }

        // Commit.
        let commit = match self.committer.commit(&task.id, &task.description) {
            Ok(commit) => commit,
            Err(error) => {
                let mut detail = format!("commit failed: {error:#}");
                match self.store.reopen(&task.id) {
                    Ok(()) => {
                        detail.push_str("\ntask reopened; agent changes left uncommitted");
                    }
                    Err(err) => {
                        warn!(
                            err = %format!("{err:#}"),
                            "could not reopen task after commit failure"
                        );
                        detail.push_str(&format!("\ntask could not be reopened: {err:#}"));
                    }
                }
                return Err(StageFailure {
                    stage: Stage::Commit,
                    task: Some(task),
                    detail: Some(detail),
                    error,
                });
            }
        };

        let remaining = self
            .store
            .count()
            .map_err(StageFailure::at(Stage::GatherContext))?;
        Ok(IterationReport {
            iteration,
            task_id: task.id,
            verification,
            commit,
            remaining,
        })
    }

    fn compose_prompt(&self, incomplete: &[Task]) -> Result<String> {
        let progress_tail = self.progress.tail(self.config.progress_tail_lines)?;
        let workdir = self.paths.root.display().to_string();
        let tasks_path = self.paths.relative(&self.paths.tasks_path).display().to_string();
        let progress_path = self
            .paths
            .relative(&self.paths.progress_path)
            .display()
            .to_string();
        render_iteration_prompt(&PromptInputs {
            workdir: &workdir,
            tasks_path: &tasks_path,
            progress_path: &progress_path,
            incomplete,
            progress_tail: &progress_tail,
        })
    }

    fn validate_claim(&self, task_id: &str) -> Result<Task> {
        match self.store.find(task_id)? {
            None => Err(LoopError::UnknownTaskId(task_id.to_string()).into()),
            Some(task) if task.passes => {
                Err(LoopError::AlreadyComplete(task_id.to_string()).into())
            }
            Some(task) => Ok(task),
        }
    }

    fn record_completion(
        &self,
        iteration: u32,
        task: &Task,
        verification: &VerificationReport,
        transcript_path: &Path,
    ) -> Result<()> {
        self.store.mark_complete(&task.id)?;
        self.progress
            .append_iteration_header(iteration, Utc::now(), &task.id, &task.description)?;
        let detail = format!(
            "verification: {}\ntranscript: {}",
            verification.summary(),
            self.paths.relative(transcript_path).display()
        );
        self.progress.append_result(ProgressStatus::Complete, &detail)
    }

    /// Append the failure entry and turn the stage failure into the run error.
    fn halt(&self, iteration: u32, failure: StageFailure) -> anyhow::Error {
        let StageFailure {
            stage,
            task,
            detail,
            error,
        } = failure;
        warn!(iteration, stage = %stage, err = %format!("{error:#}"), "iteration failed");

        let detail = detail.unwrap_or_else(|| format!("stage {stage}: {error:#}"));
        let recorded = match &task {
            Some(task) => self
                .progress
                .append_iteration_header(iteration, Utc::now(), &task.id, &task.description)
                .and_then(|()| self.progress.append_result(ProgressStatus::Failed, &detail)),
            None => self.progress.append_failure(iteration, Utc::now(), &detail),
        };
        if let Err(err) = recorded {
            warn!(err = %format!("{err:#}"), "could not append failure to progress log");
        }

        error.context(format!("iteration {iteration} failed at stage {stage}"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::parser::MarkerLineParser;
    use crate::test_support::{ScriptedAgent, ScriptedVerifier, TestRepo};
    use std::fs;

    fn config(max_iterations: u32) -> LoopConfig {
        LoopConfig {
            max_iterations,
            iteration_pause_ms: 0,
            ..LoopConfig::default()
        }
    }

    fn run(
        repo: &TestRepo,
        max_iterations: u32,
        agent: &ScriptedAgent,
        verifier: &ScriptedVerifier,
    ) -> Result<LoopOutcome> {
        run_loop(
            repo.root(),
            &config(max_iterations),
            LoopDeps {
                agent,
                verifier,
                parser: &MarkerLineParser,
            },
            |_| {},
        )
    }

    #[test]
    fn empty_backlog_completes_without_invoking_agent() {
        let repo = TestRepo::with_tasks(&[("task-1", "done already", true)]).expect("repo");
        let agent = ScriptedAgent::new(vec![]);
        let verifier = ScriptedVerifier::passing();

        let outcome = run(&repo, 5, &agent, &verifier).expect("run");

        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.exit_code(), crate::exit_codes::OK);
        assert_eq!(agent.invocations(), 0);
        assert_eq!(verifier.calls(), 0);
    }

    #[test]
    fn rate_limited_agent_is_typed_error() {
        let repo = TestRepo::with_tasks(&[("task-1", "one", false)]).expect("repo");
        let agent = ScriptedAgent::new(vec![
            ScriptedAgent::reply("Error: usage limit reached, try later").with_exit_code(1),
        ]);
        let verifier = ScriptedVerifier::passing();

        let err = run(&repo, 3, &agent, &verifier).expect_err("rate limit");

        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::RateLimit)
        ));
        assert_eq!(verifier.calls(), 0);
    }

    #[test]
    fn nonzero_exit_is_classified_but_bare_signal_proceeds() {
        let repo = TestRepo::with_tasks(&[("task-1", "one", false)]).expect("repo");
        let agent = ScriptedAgent::new(vec![
            ScriptedAgent::reply(
                "hit a rate limit earlier but recovered\nCOMPLETED_TASK_ID: task-1",
            )
            .with_exit_code(2)
                .writing("src/one.txt", "1\n"),
        ]);
        let verifier = ScriptedVerifier::passing();

        let err = run(&repo, 3, &agent, &verifier).expect_err("classified");
        assert!(
            matches!(err.downcast_ref::<LoopError>(), Some(LoopError::RateLimit)),
            "non-zero exit is classified even when a signal is present: {err:#}"
        );

        let clean = TestRepo::with_tasks(&[("task-1", "one", false)]).expect("repo");
        let agent = ScriptedAgent::new(vec![
            ScriptedAgent::reply("COMPLETED_TASK_ID: task-1")
                .with_exit_code(2)
                .writing("src/one.txt", "1\n"),
        ]);
        let outcome = run(&clean, 3, &agent, &verifier).expect("run");
        assert_eq!(outcome.completed, vec!["task-1".to_string()]);
    }

    #[test]
    fn already_complete_claim_is_fatal() {
        let repo = TestRepo::with_tasks(&[("task-1", "one", true), ("task-2", "two", false)])
            .expect("repo");
        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply("COMPLETED_TASK_ID: task-1")]);
        let verifier = ScriptedVerifier::passing();

        let err = run(&repo, 3, &agent, &verifier).expect_err("already complete");

        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::AlreadyComplete(id)) if id == "task-1"
        ));
        assert!(format!("{err:#}").contains("validate-task-id"));
        assert_eq!(verifier.calls(), 0);
    }

    #[test]
    fn observer_sees_each_iteration_and_transcript_is_kept() {
        let repo = TestRepo::with_tasks(&[("task-1", "one", false), ("task-2", "two", false)])
            .expect("repo");
        let agent = ScriptedAgent::new(vec![
            ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("one.txt", "1\n"),
            ScriptedAgent::reply("COMPLETED_TASK_ID: task-2").writing("two.txt", "2\n"),
        ]);
        let verifier = ScriptedVerifier::passing();
        let mut seen = Vec::new();

        let outcome = run_loop(
            repo.root(),
            &config(5),
            LoopDeps {
                agent: &agent,
                verifier: &verifier,
                parser: &MarkerLineParser,
            },
            |report| seen.push((report.iteration, report.task_id.clone(), report.remaining)),
        )
        .expect("run");

        assert_eq!(outcome.stop, LoopStop::AllComplete);
        assert_eq!(
            seen,
            vec![(1, "task-1".to_string(), 1), (2, "task-2".to_string(), 0)]
        );
        let paths = LoopPaths::new(repo.root());
        let transcript =
            fs::read_to_string(paths.transcript_path(&outcome.run_id, 1)).expect("transcript");
        assert!(transcript.contains("COMPLETED_TASK_ID: task-1"));
        let ignored = repo
            .git(&["check-ignore", ".taskloop/scratch/x.log"])
            .expect("check-ignore");
        assert_eq!(ignored.trim(), ".taskloop/scratch/x.log");
    }

    #[test]
    fn missing_store_fails_preflight() {
        let repo = TestRepo::new().expect("repo");
        let agent = ScriptedAgent::new(vec![]);
        let err = run(&repo, 1, &agent, &ScriptedVerifier::passing()).expect_err("no store");
        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::Environment(_))
        ));
        assert_eq!(agent.invocations(), 0);
    }
}
