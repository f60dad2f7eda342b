//! Canonical locations of loop-owned files under `.taskloop/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

const SCRATCH_GITIGNORE: &str = "scratch/\n";

/// All canonical paths within `.taskloop/` for a working directory.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tasks_path: PathBuf,
    pub progress_path: PathBuf,
    pub config_path: PathBuf,
    pub verify_hook_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".taskloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            tasks_path: state_dir.join("tasks.json"),
            progress_path: state_dir.join("progress.txt"),
            config_path: state_dir.join("config.toml"),
            verify_hook_path: state_dir.join("verify"),
            scratch_dir: state_dir.join("scratch"),
            gitignore_path: state_dir.join(".gitignore"),
        }
    }

    /// Scratch directory for one run.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.scratch_dir.join(run_id)
    }

    pub fn transcript_path(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.run_dir(run_id).join(format!("iteration-{iteration}.log"))
    }

    pub fn verify_log_path(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("iteration-{iteration}.verify.log"))
    }

    /// Path relative to the working directory, for prompts and messages.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Make sure stage-all never picks up scratch files.
pub fn ensure_scratch_ignored(paths: &LoopPaths) -> Result<()> {
    if paths.gitignore_path.exists() {
        let contents = fs::read_to_string(&paths.gitignore_path)
            .with_context(|| format!("read {}", paths.gitignore_path.display()))?;
        if contents.lines().any(|l| l.trim() == "scratch/") {
            return Ok(());
        }
        let mut updated = contents;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(SCRATCH_GITIGNORE);
        return fs::write(&paths.gitignore_path, updated)
            .with_context(|| format!("write {}", paths.gitignore_path.display()));
    }
    debug!(path = %paths.gitignore_path.display(), "creating scratch gitignore");
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, SCRATCH_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = LoopPaths::new("/work");
        assert_eq!(paths.tasks_path, Path::new("/work/.taskloop/tasks.json"));
        assert_eq!(paths.progress_path, Path::new("/work/.taskloop/progress.txt"));
        assert_eq!(paths.verify_hook_path, Path::new("/work/.taskloop/verify"));
        assert!(
            paths
                .transcript_path("run-1", 3)
                .ends_with(".taskloop/scratch/run-1/iteration-3.log")
        );
        assert_eq!(
            paths.relative(&paths.tasks_path),
            Path::new(".taskloop/tasks.json")
        );
    }

    #[test]
    fn scratch_ignore_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        ensure_scratch_ignored(&paths).expect("first");
        ensure_scratch_ignored(&paths).expect("second");
        let contents = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert_eq!(contents, "scratch/\n");
    }

    #[test]
    fn scratch_ignore_appends_to_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        fs::create_dir_all(&paths.state_dir).expect("mkdir");
        fs::write(&paths.gitignore_path, "notes.md").expect("write");
        ensure_scratch_ignored(&paths).expect("ensure");
        let contents = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert_eq!(contents, "notes.md\nscratch/\n");
    }
}
