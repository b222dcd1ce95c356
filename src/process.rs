//! Worker process supervision: process-group spawn, merged output streaming,
//! and whole-group termination.
//!
//! The worker is launched as the leader of its own process group so that any
//! descendants it forks can be signalled together. Its stdout and stderr are
//! pumped line-by-line into one channel, the "combined output stream" the
//! rest of the engine consumes.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ScanError;

/// Upper bound on waiting for the pump tasks after the child is gone. They
/// end at pipe EOF, so this only matters if the group somehow survives.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A live worker process plus its output plumbing. Dropping the handle kills
/// the leader (`kill_on_drop`), so no exit path leaks a running child.
pub struct ProcessHandle {
    pub pid: u32,
    child: Child,
    lines: Option<UnboundedReceiver<String>>,
    pumps: Vec<JoinHandle<()>>,
    cancel_requested: bool,
}

/// Launch the worker as a process-group leader with merged output capture.
pub fn spawn(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<ProcessHandle, ScanError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    sys::configure_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| ScanError::Launch {
        program: program.display().to_string(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    debug!(pid, program = %program.display(), "scan worker spawned");

    let (tx, rx) = mpsc::unbounded_channel();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_lines(stderr, tx.clone()));
    }
    // The receiver sees end-of-stream once both pumps drop their senders.
    drop(tx);

    Ok(ProcessHandle {
        pid,
        child,
        lines: Some(rx),
        pumps,
        cancel_requested: false,
    })
}

impl ProcessHandle {
    /// The merged line stream. Lines arrive in read order per pipe; a final
    /// line without a trailing terminator is still delivered.
    pub fn take_lines(&mut self) -> UnboundedReceiver<String> {
        self.lines.take().expect("output stream already taken")
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Wait for the worker to exit. On timeout the whole group is killed and
    /// [`ScanError::Timeout`] names the configured duration.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, ScanError> {
        match timeout {
            None => Ok(self.child.wait().await?),
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    warn!(pid = self.pid, "scan worker timed out; killing process group");
                    sys::kill_group(self.pid, true).await;
                    let _ = self.child.wait().await;
                    self.join_pumps().await;
                    Err(ScanError::Timeout(limit))
                }
            },
        }
    }

    /// Terminate the whole process group: termination signal, bounded grace
    /// wait, forced kill if the group is still alive, then unblock and join
    /// the pump tasks.
    ///
    /// Idempotent, and safe to call after the worker already exited.
    pub async fn terminate(&mut self, grace: Duration, kill_wait: Duration) {
        if self.cancel_requested {
            return;
        }
        self.cancel_requested = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "terminate requested after natural exit");
            }
            _ => {
                sys::kill_group(self.pid, false).await;
                let exited = tokio::time::timeout(grace, self.child.wait()).await.is_ok();
                if !exited {
                    warn!(pid = self.pid, "grace period elapsed; escalating to forced kill");
                    sys::kill_group(self.pid, true).await;
                    if tokio::time::timeout(kill_wait, self.child.wait()).await.is_err() {
                        warn!(pid = self.pid, "process group survived forced kill");
                    }
                }
            }
        }

        self.join_pumps().await;
    }

    async fn join_pumps(&mut self) {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(PUMP_JOIN_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
        }
    }
}

/// Is the process with this PID still running? EPERM counts as alive: the
/// process exists but belongs to another user.
pub fn process_alive(pid: u32) -> bool {
    sys::process_alive(pid)
}

fn pump_lines<R>(reader: R, tx: UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;
    use tokio::process::Command;
    use tracing::debug;

    pub(super) fn configure_group(cmd: &mut Command) {
        // New process group with the child as leader (pgid == child pid).
        cmd.process_group(0);
    }

    pub(super) async fn kill_group(pid: u32, forced: bool) {
        if pid == 0 || pid > i32::MAX as u32 {
            return;
        }
        let signal = if forced { Signal::SIGKILL } else { Signal::SIGTERM };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(pid, ?signal, error = %e, "process group signal failed"),
        }
    }

    pub(super) fn process_alive(pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
    }
}

#[cfg(windows)]
mod sys {
    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub(super) fn configure_group(cmd: &mut Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub(super) async fn kill_group(pid: u32, forced: bool) {
        // `taskkill /T` walks the child tree, the closest equivalent of a
        // process-group signal on this platform.
        let mut cmd = Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string()).arg("/T");
        if forced {
            cmd.arg("/F");
        }
        let _ = cmd.output().await;
    }

    pub(super) fn process_alive(pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}
