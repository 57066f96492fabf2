//! Process supervision with a wall-clock timeout and process-tree kill.
//!
//! Every command runs through `sh -c` (or `cmd /C` on Windows) in its own
//! process group. When the timer wins the race against the child, the whole
//! group is killed with `SIGKILL`; if the group signal fails the child is
//! killed directly. [`run_command`] never fails: spawn errors, pipe errors
//! and timeouts all come back as a populated [`CommandResult`].

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::paths::EnvMap;

/// Exit code reported when the command could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Captured output is trimmed to this many trailing bytes per stream.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for pipe readers once the child has been reaped.
/// Background grandchildren may hold the pipes open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A shell command to supervise.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a EnvMap,
    pub timeout: Duration,
}

/// Outcome of one supervised command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
}

impl CommandResult {
    /// Exit code zero and no timeout.
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout and stderr joined, for text classification.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr)
        }
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // A read error just ends capture; whatever arrived is kept.
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn drain(handle: JoinHandle<Vec<u8>>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => tail_lossy(&bytes, MAX_CAPTURE_BYTES),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            debug!("output pipe still open after child exit; dropping reader");
            String::new()
        }
    }
}

fn tail_lossy(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - max..]).into_owned();
    format!("...(truncated)...\n{tail}")
}

/// SIGKILL every process in group `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Kill the child's whole process group, falling back to the child alone.
/// The child was spawned with `process_group(0)`, so its pid is the pgid.
fn kill_process_tree(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            match kill_group(pgid) {
                Ok(()) => {
                    debug!(pgid, "killed process group");
                    return;
                }
                Err(e) => warn!(pgid, error = %e, "process group kill failed; killing child directly"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "direct kill failed");
    }
}

/// Kill anything the exited child left running in its group. An empty
/// group is the normal case.
fn reap_stragglers(pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            match kill_group(pgid) {
                Ok(()) => debug!(pgid, "killed leftover background processes"),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => warn!(pgid, error = %e, "failed to kill leftover background processes"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Run `spec.command` to completion or timeout. Never returns an error.
pub async fn run_command(spec: &CommandSpec<'_>) -> CommandResult {
    let started = Instant::now();
    debug!(
        command = %spec.command,
        cwd = %spec.cwd.display(),
        timeout_ms = spec.timeout.as_millis() as u64,
        "spawning command"
    );

    let mut cmd = shell_command(spec.command);
    cmd.current_dir(spec.cwd)
        .env_clear()
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %spec.command, error = %e, "failed to spawn command");
            return CommandResult {
                command: spec.command.to_string(),
                exit_code: Some(SPAWN_FAILURE_EXIT_CODE),
                duration_ms: started.elapsed().as_millis() as u64,
                stdout: String::new(),
                stderr: format!("spawn failed: {e}"),
                timed_out: false,
                spawn_error: Some(e.to_string()),
            };
        }
    };

    // Captured now: tokio forgets the pid once the child is reaped.
    let pgid = child.id();
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
    let (exit_code, timed_out) = match waited {
        Ok(Ok(status)) => {
            reap_stragglers(pgid);
            (status.code(), false)
        }
        Ok(Err(e)) => {
            warn!(command = %spec.command, error = %e, "failed waiting for command");
            kill_process_tree(&mut child, pgid);
            let _ = child.wait().await;
            (None, false)
        }
        Err(_) => {
            info!(
                command = %spec.command,
                timeout_ms = spec.timeout.as_millis() as u64,
                "command timed out; killing process tree"
            );
            kill_process_tree(&mut child, pgid);
            // SIGKILL cannot be ignored, so reaping is bounded.
            let _ = child.wait().await;
            (None, true)
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    debug!(
        command = %spec.command,
        exit_code = ?exit_code,
        timed_out,
        duration_ms,
        "command finished"
    );

    CommandResult {
        command: spec.command.to_string(),
        exit_code,
        duration_ms,
        stdout,
        stderr,
        timed_out,
        spawn_error: None,
    }
}
