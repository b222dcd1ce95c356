//! Top-level orchestration of scan sessions: lock acquisition, worker
//! supervision, live progress interpretation, result classification, and
//! the one-shot automatic recovery retry.
//!
//! One coordinator instance owns one directory's lock artifact and at most
//! one running session. Callers drive it from their own task and may cancel
//! from any thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::{self, Outcome};
use crate::error::ScanError;
use crate::lock::{now_rfc3339, LockRecord, ScanLock};
use crate::process;
use crate::progress::{ProgressInterpreter, ProgressUpdate};
use crate::types::{FailureKind, ScanOptions, ScanReport, ScanStats, SessionStatus};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(3);
const DEFAULT_JOIN_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(30);

/// Bookkeeping for the most recent session, readable for UI probes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanSession {
    pub command: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: SessionStatus,
    pub error: Option<String>,
}

/// Composes the lock, the process supervisor, the progress interpreter and
/// the result classifier into one session-at-a-time engine.
pub struct ScanCoordinator {
    lock: ScanLock,
    grace: Duration,
    kill_wait: Duration,
    join_wait: Duration,
    stall_after: Duration,
    cancel: Mutex<CancellationToken>,
    session: Mutex<Option<ScanSession>>,
}

struct Attempt {
    outcome: Outcome,
    raw_output: String,
}

impl ScanCoordinator {
    /// Coordinator whose lock artifact lives in `dir`. Sweeps a stale lock
    /// left behind by a crashed predecessor.
    pub fn new(dir: impl AsRef<std::path::Path>) -> Self {
        let lock = ScanLock::new(dir);
        lock.cleanup_stale();
        Self {
            lock,
            grace: DEFAULT_GRACE_PERIOD,
            kill_wait: DEFAULT_KILL_WAIT,
            join_wait: DEFAULT_JOIN_WAIT,
            stall_after: DEFAULT_STALL_AFTER,
            cancel: Mutex::new(CancellationToken::new()),
            session: Mutex::new(None),
        }
    }

    /// How long the process group gets between the termination signal and
    /// the forced kill.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_kill_wait(mut self, kill_wait: Duration) -> Self {
        self.kill_wait = kill_wait;
        self
    }

    pub fn with_join_wait(mut self, join_wait: Duration) -> Self {
        self.join_wait = join_wait;
        self
    }

    /// Progress-stall threshold forwarded to the interpreter.
    pub fn with_stall_threshold(mut self, stall_after: Duration) -> Self {
        self.stall_after = stall_after;
        self
    }

    /// Staleness-aware probe of the lock artifact, for UI use. Does not
    /// start anything.
    pub fn is_scan_active(&self) -> bool {
        self.lock.is_active()
    }

    /// Who holds the lock, if anyone.
    pub fn lock_record(&self) -> Option<LockRecord> {
        self.lock.read_record()
    }

    /// Snapshot of the most recent session.
    pub fn session(&self) -> Option<ScanSession> {
        self.session.lock().expect("session state").clone()
    }

    /// Request cancellation of the running session. Idempotent, callable
    /// from any thread, and bounded by grace + kill + join waits. A no-op
    /// when nothing is running.
    pub fn cancel_scan(&self) {
        info!("scan cancellation requested");
        self.cancel.lock().expect("cancel token").cancel();
    }

    /// Run one scan session to completion.
    ///
    /// Fails fast with [`ScanError::LockHeld`] when another live process
    /// owns the lock. Every line of worker output goes to `on_log`; every
    /// recognized progress event goes to `on_progress`, in read order, from
    /// the session's streaming task only. The lock is released on every
    /// exit path.
    pub async fn run_scan<P, L>(
        &self,
        options: &ScanOptions,
        on_progress: P,
        on_log: L,
    ) -> Result<ScanReport, ScanError>
    where
        P: Fn(ProgressUpdate) + Send + Sync + 'static,
        L: Fn(&str) + Send + Sync + 'static,
    {
        let guard = self
            .lock
            .acquire(&options.scan_kind, options.scope.as_deref())?;

        // Fresh token per session so an earlier cancellation cannot bleed
        // into this one.
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel token") = cancel.clone();

        self.set_session(ScanSession {
            command: options.display_command(),
            start_time: now_rfc3339(),
            end_time: None,
            status: SessionStatus::Running,
            error: None,
        });

        let on_progress = Arc::new(on_progress);
        let on_log = Arc::new(on_log);
        let result = self
            .run_with_recovery(options, &cancel, &on_progress, &on_log)
            .await;

        match &result {
            Ok(report) => self.finish_session(
                report.status,
                report.failure.as_ref().map(|f| f.detail.clone()),
            ),
            Err(e) => self.finish_session(SessionStatus::Failed, Some(e.to_string())),
        }

        drop(guard);
        result
    }

    /// One attempt, plus the single permitted broadened retry after a
    /// `NoRecentTargets` classification. The retry never recurses.
    async fn run_with_recovery<P, L>(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        on_progress: &Arc<P>,
        on_log: &Arc<L>,
    ) -> Result<ScanReport, ScanError>
    where
        P: Fn(ProgressUpdate) + Send + Sync + 'static,
        L: Fn(&str) + Send + Sync + 'static,
    {
        let attempt = self.run_attempt(options, cancel, on_progress, on_log).await?;

        if let Outcome::Failed(failure) = &attempt.outcome {
            if failure.kind == FailureKind::NoRecentTargets {
                info!("no recent targets reported; retrying once with a broadened scope");
                (on_progress.as_ref())(ProgressUpdate {
                    percentage: Some(0.0),
                    message: "No recent targets found - retrying with a broadened scope..."
                        .to_string(),
                    phase: None,
                });
                let broadened = options.broadened();
                let retry = self
                    .run_attempt(&broadened, cancel, on_progress, on_log)
                    .await?;
                return Ok(build_report(retry, true));
            }
        }

        Ok(build_report(attempt, false))
    }

    async fn run_attempt<P, L>(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        on_progress: &Arc<P>,
        on_log: &Arc<L>,
    ) -> Result<Attempt, ScanError>
    where
        P: Fn(ProgressUpdate) + Send + Sync + 'static,
        L: Fn(&str) + Send + Sync + 'static,
    {
        let args = options.command_args();
        let mut handle =
            process::spawn(&options.program, &args, options.cwd.as_deref(), &options.env)?;

        let interpreter = ProgressInterpreter::with_stall_threshold(self.stall_after);
        let lines = handle.take_lines();
        let mut stream_task = tokio::spawn(stream_lines(
            lines,
            interpreter,
            Arc::clone(on_progress),
            Arc::clone(on_log),
        ));

        // The output pipe must be drained concurrently with this wait or
        // the child can block on a full pipe.
        let wait_result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = handle.wait(options.timeout) => Some(result),
        };

        if wait_result.is_none() {
            info!(pid = handle.pid, "terminating worker process group");
            handle.terminate(self.grace, self.kill_wait).await;
        }

        // Classification may only see a buffer the streaming task has fully
        // drained; join it before looking at the output.
        let output_lines = match tokio::time::timeout(self.join_wait, &mut stream_task).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "output streaming task failed");
                Vec::new()
            }
            Err(_) => {
                warn!("output streaming task did not drain in time");
                stream_task.abort();
                Vec::new()
            }
        };
        let raw_output = output_lines.join("\n");

        match wait_result {
            None => Ok(Attempt {
                outcome: Outcome::Cancelled,
                raw_output,
            }),
            Some(Err(e)) => Err(e),
            Some(Ok(status)) => {
                let outcome =
                    classify::finalize(&raw_output, status.code(), cancel.is_cancelled());
                Ok(Attempt { outcome, raw_output })
            }
        }
    }

    fn set_session(&self, session: ScanSession) {
        *self.session.lock().expect("session state") = Some(session);
    }

    fn finish_session(&self, status: SessionStatus, error: Option<String>) {
        if let Some(session) = self.session.lock().expect("session state").as_mut() {
            session.status = status;
            session.end_time = Some(now_rfc3339());
            session.error = error;
        }
    }
}

/// The session's single streaming worker: tails the merged output channel,
/// feeds the log sink, the interpreter and the capture buffer. The sinks
/// are invoked here and nowhere else, so they never race themselves.
async fn stream_lines<P, L>(
    mut lines: UnboundedReceiver<String>,
    mut interpreter: ProgressInterpreter,
    on_progress: Arc<P>,
    on_log: Arc<L>,
) -> Vec<String>
where
    P: Fn(ProgressUpdate) + Send + Sync + 'static,
    L: Fn(&str) + Send + Sync + 'static,
{
    let mut captured = Vec::new();
    while let Some(line) = lines.recv().await {
        (on_log.as_ref())(&line);
        if let Some(update) = interpreter.feed(&line) {
            (on_progress.as_ref())(update);
        }
        captured.push(line);
    }
    captured
}

/// Exactly one human-readable summary per terminal state.
fn build_report(attempt: Attempt, recovery_attempted: bool) -> ScanReport {
    match attempt.outcome {
        Outcome::Cancelled => ScanReport {
            status: SessionStatus::Cancelled,
            stats: ScanStats::default(),
            stats_found: false,
            failure: None,
            recovery_attempted,
            summary: "Scan cancelled by user".to_string(),
            raw_output: attempt.raw_output,
        },
        Outcome::Completed { stats, stats_found } => {
            let summary = if stats_found {
                format!(
                    "Scan completed: {} hosts scanned, {} accessible",
                    stats.hosts_scanned, stats.hosts_accessible
                )
            } else {
                "Scan completed, but no statistics could be extracted from the worker output"
                    .to_string()
            };
            ScanReport {
                status: SessionStatus::Completed,
                stats,
                stats_found,
                failure: None,
                recovery_attempted,
                summary,
                raw_output: attempt.raw_output,
            }
        }
        Outcome::Failed(failure) => {
            let summary = match failure.kind {
                FailureKind::NoRecentTargets => {
                    "Scan failed: no recent targets were available".to_string()
                }
                FailureKind::TargetsNotAuthenticated => {
                    "Scan failed: the requested targets are not authenticated; run discovery first"
                        .to_string()
                }
                FailureKind::MissingRuntimeDependency => failure.detail.clone(),
                FailureKind::Generic => format!("Scan failed: {}", failure.detail),
            };
            ScanReport {
                status: SessionStatus::Failed,
                stats: ScanStats::default(),
                stats_found: false,
                failure: Some(failure),
                recovery_attempted,
                summary,
                raw_output: attempt.raw_output,
            }
        }
    }
}
