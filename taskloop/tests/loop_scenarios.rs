//! End-to-end controller scenarios against real git repositories.
//!
//! The agent is scripted; verification is scripted except where the real
//! pipeline's hook handling is under test.

#![cfg(unix)]

use std::fs;
use std::time::Duration;

use anyhow::Result;
use taskloop::controller::{LoopDeps, LoopOutcome, LoopStop, run_loop};
use taskloop::core::parser::MarkerLineParser;
use taskloop::error::LoopError;
use taskloop::exit_codes;
use taskloop::io::config::LoopConfig;
use taskloop::io::progress_log::NO_HISTORY;
use taskloop::io::verifier::{PipelineVerifier, Verifier};
use taskloop::test_support::{ScriptedAgent, ScriptedVerifier, TestRepo};

fn config(max_iterations: u32) -> LoopConfig {
    LoopConfig {
        max_iterations,
        iteration_pause_ms: 0,
        ..LoopConfig::default()
    }
}

fn run<V: Verifier>(
    repo: &TestRepo,
    max_iterations: u32,
    agent: &ScriptedAgent,
    verifier: &V,
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

fn two_tasks() -> TestRepo {
    TestRepo::with_tasks(&[
        ("task-1", "Add the greeting module", false),
        ("task-2", "Document the greeting module", false),
    ])
    .expect("repo")
}

#[test]
fn empty_backlog_exits_ok_without_agent() {
    let repo = TestRepo::with_tasks(&[("task-1", "done", true), ("task-2", "done", true)])
        .expect("repo");
    let agent = ScriptedAgent::new(vec![]);

    let outcome = run(&repo, 10, &agent, &ScriptedVerifier::passing()).expect("run");

    assert_eq!(outcome.stop, LoopStop::AllComplete);
    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(agent.invocations(), 0);
    assert!(repo.progress().expect("progress").is_empty());
}

#[test]
fn first_iteration_completes_one_task_and_commits() {
    let repo = two_tasks();
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("implemented greeting\nCOMPLETED_TASK_ID: task-1\n")
            .writing("src/greeting.txt", "hello\n"),
    ]);

    let outcome = run(&repo, 1, &agent, &ScriptedVerifier::passing()).expect("run");

    let tasks = repo.tasks().expect("tasks");
    assert!(tasks[0].passes, "task-1 flipped");
    assert!(!tasks[1].passes, "task-2 untouched");
    assert_eq!(tasks[1].description, "Document the greeting module");
    assert_eq!(repo.commit_count().expect("count"), commits_before + 1);

    let progress = repo.progress().expect("progress");
    assert_eq!(progress.matches("## Iteration").count(), 1);
    assert!(progress.contains("Task: task-1"));
    assert!(progress.contains("Status: complete"));

    assert_eq!(outcome.completed, vec!["task-1".to_string()]);
    assert_eq!(outcome.stop, LoopStop::MaxIterationsReached { remaining: 1 });
    assert_eq!(outcome.exit_code(), exit_codes::FAILURE);

    let subject = repo
        .git(&["log", "-1", "--format=%s"])
        .expect("log");
    assert_eq!(subject.trim(), "feat(task-1): Add the greeting module");
    assert!(
        repo.git(&["status", "--porcelain"]).expect("status").trim().is_empty(),
        "store, progress and work are committed; scratch is ignored"
    );
}

#[test]
fn loop_proceeds_to_second_iteration_with_history() {
    let repo = two_tasks();
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("a.txt", "a\n"),
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-2").writing("b.txt", "b\n"),
    ]);

    let outcome = run(&repo, 10, &agent, &ScriptedVerifier::passing()).expect("run");

    assert_eq!(outcome.stop, LoopStop::AllComplete);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(agent.invocations(), 2);
    assert_eq!(repo.commit_count().expect("count"), commits_before + 2);
    assert!(repo.tasks().expect("tasks").iter().all(|t| t.passes));

    let prompts = agent.prompts();
    assert!(prompts[0].contains(NO_HISTORY));
    assert!(prompts[0].contains("\"id\": \"task-2\""));
    assert!(prompts[1].contains("## Iteration 1"));
    assert!(!prompts[1].contains("\"id\": \"task-1\""), "completed task left the backlog");
}

#[test]
fn missing_completion_signal_halts_and_records_failure() {
    let repo = two_tasks();
    let store_before = fs::read(repo.paths().tasks_path).expect("read store");
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("I looked around but did not finish anything."),
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1"),
    ]);
    let verifier = ScriptedVerifier::passing();

    let err = run(&repo, 10, &agent, &verifier).expect_err("no signal");

    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::NoCompletionSignal { .. })
    ));
    assert_eq!(agent.invocations(), 1, "no automatic retry");
    assert_eq!(verifier.calls(), 0);
    assert_eq!(
        fs::read(repo.paths().tasks_path).expect("read store"),
        store_before
    );
    assert_eq!(repo.commit_count().expect("count"), commits_before);
    let progress = repo.progress().expect("progress");
    assert!(progress.contains("Status: failed"));
    assert!(progress.contains("parse-result"));
}

#[test]
fn blocking_verification_failure_leaves_store_and_history_alone() {
    let repo = two_tasks();
    let store_before = fs::read(repo.paths().tasks_path).expect("read store");
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("broken.txt", "x\n"),
    ]);

    let err = run(&repo, 10, &agent, &ScriptedVerifier::failing("test greeting ... FAILED"))
        .expect_err("verification");

    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::Verification(_))
    ));
    assert_eq!(
        fs::read(repo.paths().tasks_path).expect("read store"),
        store_before
    );
    assert_eq!(repo.commit_count().expect("count"), commits_before);
    let progress = repo.progress().expect("progress");
    assert!(progress.contains("Task: task-1"));
    assert!(progress.contains("Status: failed"));
    assert!(progress.contains("test greeting ... FAILED"));
}

#[test]
fn unknown_task_id_is_fatal() {
    let repo = two_tasks();
    let store_before = fs::read(repo.paths().tasks_path).expect("read store");
    let agent = ScriptedAgent::new(vec![ScriptedAgent::reply("COMPLETED_TASK_ID: task-99")]);
    let verifier = ScriptedVerifier::passing();

    let err = run(&repo, 10, &agent, &verifier).expect_err("unknown id");

    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::UnknownTaskId(id)) if id == "task-99"
    ));
    assert_eq!(verifier.calls(), 0);
    assert_eq!(
        fs::read(repo.paths().tasks_path).expect("read store"),
        store_before
    );
}

#[test]
fn restated_signal_uses_last_occurrence() {
    let repo = two_tasks();
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply(
            "Plan: finish COMPLETED_TASK_ID: task-1\n...\nactually did the docs\nCOMPLETED_TASK_ID: task-2\n",
        )
        .writing("docs.md", "# docs\n"),
    ]);

    run(&repo, 1, &agent, &ScriptedVerifier::passing()).expect("run");

    let tasks = repo.tasks().expect("tasks");
    assert!(!tasks[0].passes);
    assert!(tasks[1].passes);
}

#[test]
fn failing_verify_hook_blocks_commit_and_logs_output() {
    let repo = two_tasks();
    repo.install_verify_hook("#!/bin/sh\necho 'hook: 2 tests failed'\nexit 1\n")
        .expect("hook");
    repo.git(&["add", "-A"]).expect("add");
    repo.git(&["commit", "-q", "-m", "add verify hook"]).expect("commit");
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("a.txt", "a\n"),
    ]);
    let verifier = PipelineVerifier::new(false, Duration::from_secs(30), 10_000);

    let err = run(&repo, 10, &agent, &verifier).expect_err("hook failure");

    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::Verification(_))
    ));
    assert_eq!(repo.commit_count().expect("count"), commits_before);
    assert!(repo.progress().expect("progress").contains("hook: 2 tests failed"));
}

#[test]
fn passing_verify_hook_allows_commit() {
    let repo = two_tasks();
    repo.install_verify_hook("#!/bin/sh\ntest -f a.txt\n").expect("hook");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("a.txt", "a\n"),
    ]);
    let verifier = PipelineVerifier::new(false, Duration::from_secs(30), 10_000);

    let outcome = run(&repo, 1, &agent, &verifier).expect("run");

    assert_eq!(outcome.completed, vec!["task-1".to_string()]);
    let committed = repo
        .git(&["show", "--name-only", "--format=", "HEAD"])
        .expect("show");
    assert!(committed.lines().any(|l| l == "a.txt"));
    assert!(committed.lines().any(|l| l == ".taskloop/tasks.json"));
    assert!(committed.lines().any(|l| l == ".taskloop/progress.txt"));
    assert!(!committed.contains("scratch/"));
}

#[test]
fn rejected_commit_halts_and_reopens_task() {
    let repo = two_tasks();
    repo.install_hook("pre-commit", "#!/bin/sh\necho 'lint: trailing whitespace' >&2\nexit 1\n")
        .expect("hook");
    let commits_before = repo.commit_count().expect("count");
    let agent = ScriptedAgent::new(vec![
        ScriptedAgent::reply("COMPLETED_TASK_ID: task-1").writing("a.txt", "a \n"),
    ]);

    let err = run(&repo, 10, &agent, &ScriptedVerifier::passing()).expect_err("commit");

    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::Commit(_))
    ));
    assert!(format!("{err:#}").contains("stage commit"));
    assert_eq!(repo.commit_count().expect("count"), commits_before);
    assert!(
        repo.tasks().expect("tasks").iter().all(|t| !t.passes),
        "uncommitted completion is undone"
    );

    let progress = repo.progress().expect("progress");
    assert_eq!(progress.matches("## Iteration 1").count(), 2);
    assert_eq!(progress.matches("Task: task-1").count(), 2);
    let failed = progress
        .rsplit("## Iteration 1")
        .next()
        .expect("failure entry");
    assert!(failed.contains("Status: failed"));
    assert!(failed.contains("commit failed"));
    assert!(failed.contains("task reopened"));
}
