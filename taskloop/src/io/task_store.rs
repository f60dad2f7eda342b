//! Task backlog load/save with schema + invariant validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use jsonschema::Validator;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::types::Task;
use crate::error::LoopError;

const TASKS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/tasks/v1.schema.json"
));

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).expect("embedded schema is valid json");
    jsonschema::validator_for(&schema).expect("embedded schema compiles")
});

/// File-backed task backlog (`.taskloop/tasks.json`).
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate every task, in file order.
    pub fn load(&self) -> Result<Vec<Task>> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read task store {}", self.path.display()))?;
        parse_tasks(&self.path, &contents)
    }

    /// Tasks with `passes == false`, in original order.
    pub fn list_incomplete(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.into_iter().filter(|t| !t.passes).collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.list_incomplete()?.len())
    }

    pub fn find(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load()?.into_iter().find(|t| t.id == id))
    }

    /// Set `passes = true` for `id`.
    ///
    /// Read-modify-write with a temp file + rename; an absent id leaves the
    /// file untouched and fails with [`LoopError::TaskNotFound`].
    #[instrument(skip_all, fields(task_id = id))]
    pub fn mark_complete(&self, id: &str) -> Result<()> {
        self.set_passes(id, true)?;
        info!("task marked complete");
        Ok(())
    }

    /// Undo [`TaskStore::mark_complete`] when the completion could not be
    /// committed.
    #[instrument(skip_all, fields(task_id = id))]
    pub fn reopen(&self, id: &str) -> Result<()> {
        self.set_passes(id, false)?;
        info!("task reopened");
        Ok(())
    }

    fn set_passes(&self, id: &str, passes: bool) -> Result<()> {
        let mut tasks = self.load()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LoopError::TaskNotFound(id.to_string()))?;
        if task.passes == passes {
            debug!(passes, "task already in requested state");
        }
        task.passes = passes;
        self.write(&tasks)
    }

    fn write(&self, tasks: &[Task]) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(tasks).context("serialize tasks")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn parse_tasks(path: &Path, contents: &str) -> Result<Vec<Task>> {
    let malformed = |reason: String| LoopError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    let value: Value =
        serde_json::from_str(contents).map_err(|err| malformed(format!("invalid json: {err}")))?;
    let messages: Vec<String> = VALIDATOR.iter_errors(&value).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(malformed(format!("schema validation failed: {}", messages.join("; "))).into());
    }
    let tasks: Vec<Task> =
        serde_json::from_value(value).map_err(|err| malformed(err.to_string()))?;
    let mut seen = HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(malformed(format!("duplicate task id '{}'", task.id)).into());
        }
    }
    Ok(tasks)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("task store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp task store {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace task store {}", path.display()))?;
    Ok(())
}
