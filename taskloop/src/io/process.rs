//! Child-process helpers: timeouts, bounded capture, optional transcript tee.

use std::env;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    pub fn truncation_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

/// Capture settings for [`run_captured`].
#[derive(Debug, Clone, Copy)]
pub struct Capture<'a> {
    pub timeout: Duration,
    /// Bytes kept in memory per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// When set, every stdout and stderr line is appended here as it arrives.
    pub tee_path: Option<&'a Path>,
}

type SharedTee = std::sync::Arc<Option<std::sync::Mutex<BufWriter<File>>>>;

/// Run `cmd` with stdin closed, reading both pipes concurrently so the child
/// can never block on a full pipe.
///
/// On unix the child leads its own process group. When `timeout` elapses the
/// whole group is killed, so grandchildren holding the pipes cannot outlive it.
#[instrument(
    skip_all,
    fields(timeout_secs = capture.timeout.as_secs(), teed = capture.tee_path.is_some())
)]
pub fn run_captured(mut cmd: Command, capture: Capture<'_>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee: SharedTee = std::sync::Arc::new(match capture.tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create transcript dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create transcript {}", path.display()))?;
            Some(std::sync::Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = capture.output_limit_bytes;
    let stdout_tee = tee.clone();
    let stderr_tee = tee.clone();
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, stdout_tee));
    let stderr_handle = thread::spawn(move || read_lines_limited(stderr, limit, stderr_tee));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(capture.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = capture.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            // The leader may already be gone if the group kill reached it.
            if let Err(e) = child.kill() {
                debug!(err = %e, "kill after group kill");
            }
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let target = format!("-{pgid}");
    match Command::new("kill")
        .args(["-KILL", "--", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pgid, "killed process group"),
        Ok(status) => warn!(pgid, exit_code = ?status.code(), "kill process group failed"),
        Err(e) => warn!(pgid, err = %e, "could not run kill for process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    tee: SharedTee,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read output line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = &*tee {
            if let Ok(mut writer) = mutex.lock() {
                // Flush per line so a killed child still leaves a usable transcript.
                if let Err(e) = writer.write_all(&line).and_then(|()| writer.flush()) {
                    warn!(err = %e, "failed to write transcript line");
                }
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

/// True if `name` resolves to a file on `PATH`.
pub fn command_exists(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| {
        let full = dir.join(name);
        full.is_file() || full.is_symlink()
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_tees_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs/out.log");
        let output = run_captured(
            sh("echo out; echo err >&2; exit 3"),
            Capture {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
                tee_path: Some(&tee),
            },
        )
        .expect("run");

        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert_eq!(output.combined_lossy(), "out\nerr\n");
        let transcript = fs::read_to_string(&tee).expect("read tee");
        assert!(transcript.contains("out\n"));
        assert!(transcript.contains("err\n"));
    }

    #[test]
    fn kills_child_on_timeout() {
        let output = run_captured(
            sh("echo started; sleep 5"),
            Capture {
                timeout: Duration::from_millis(200),
                output_limit_bytes: 1_000,
                tee_path: None,
            },
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.stdout, b"started\n");
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = std::time::Instant::now();
        let output = run_captured(
            sh("echo started; sleep 8; echo done"),
            Capture {
                timeout: Duration::from_millis(500),
                output_limit_bytes: 1_000,
                tee_path: None,
            },
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.stdout, b"started\n");
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn bounds_in_memory_capture() {
        let output = run_captured(
            sh("printf 'abcdefghij\\n'"),
            Capture {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 4,
                tee_path: None,
            },
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 7);
        assert!(output.truncation_notice("agent").contains("truncated 7 bytes"));
    }

    #[test]
    fn command_exists_finds_shell() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely-not-a-real-binary-taskloop"));
    }
}
