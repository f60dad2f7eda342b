//! Iteration prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::parser::{COMPLETION_MARKER, completion_line};
use crate::core::types::Task;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Everything the agent is told about the current iteration.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub workdir: &'a str,
    pub tasks_path: &'a str,
    pub progress_path: &'a str,
    pub incomplete: &'a [Task],
    pub progress_tail: &'a str,
}

pub fn render_iteration_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("iteration", ITERATION_TEMPLATE)
        .context("load iteration template")?;
    let tasks_json =
        serde_json::to_string_pretty(input.incomplete).context("serialize backlog for prompt")?;
    let rendered = env
        .get_template("iteration")?
        .render(context! {
            workdir => input.workdir,
            tasks_path => input.tasks_path,
            progress_path => input.progress_path,
            tasks_json => tasks_json,
            progress => input.progress_tail.trim_end(),
            marker_line => completion_line("<task-id>"),
        })
        .context("render iteration prompt")?;
    debug!(bytes = rendered.len(), marker = COMPLETION_MARKER, "rendered prompt");
    Ok(rendered)
}
