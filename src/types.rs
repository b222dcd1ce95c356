use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Final statistics extracted from the worker's output.
///
/// The worker has shipped two label vocabularies over time ("Hosts Scanned"
/// vs the older "Hosts Tested" family); both are parsed and reconciled into
/// these canonical counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub hosts_scanned: u64,
    pub hosts_accessible: u64,
    pub accessible_shares: u64,
    pub session_id: Option<String>,
}

/// Lifecycle state of a scan session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Classified worker failure kinds, derived from sentinel phrases in the
/// worker's output after a non-zero exit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker found no targets within the configured recency window.
    /// Eligible for exactly one automatic broadened retry.
    NoRecentTargets,
    /// The requested targets exist but have no established authentication.
    TargetsNotAuthenticated,
    /// The worker's runtime environment is missing a required library.
    MissingRuntimeDependency,
    /// Any other non-zero exit.
    Generic,
}

/// A classified worker failure plus the context extracted for it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Human-readable detail: sentinel line, remediation text, or the last
    /// few output lines verbatim for generic failures.
    pub detail: String,
    pub exit_code: Option<i32>,
}

/// Everything a caller learns about one finished session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanReport {
    pub status: SessionStatus,
    pub stats: ScanStats,
    /// False when no statistics could be extracted from the output at all;
    /// callers may then fall back to an external data source.
    pub stats_found: bool,
    pub failure: Option<Failure>,
    /// Whether the automatic broadened-scope retry ran for this session.
    pub recovery_attempted: bool,
    /// Exactly one human-readable summary per terminal state.
    pub summary: String,
    pub raw_output: String,
}

impl ScanReport {
    pub fn success(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn cancelled(&self) -> bool {
        self.status == SessionStatus::Cancelled
    }
}

/// How to invoke the scan worker for one session.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Worker executable.
    pub program: PathBuf,
    /// Fixed argument vector passed through as-is.
    pub args: Vec<String>,
    /// Working directory for the worker (defaults to the current one).
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the worker.
    pub env: Vec<(String, String)>,
    /// Recency window appended as `--recent-days N`. Cleared by the
    /// automatic recovery retry to broaden the scope.
    pub recent_days: Option<u32>,
    /// Overall session timeout. `None` means wait indefinitely.
    pub timeout: Option<Duration>,
    /// Recorded in the lock artifact for operator-facing probes.
    pub scan_kind: String,
    pub scope: Option<String>,
}

impl ScanOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            recent_days: None,
            timeout: None,
            scan_kind: "scan".to_string(),
            scope: None,
        }
    }

    /// Full argument vector for one invocation.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(days) = self.recent_days {
            args.push("--recent-days".to_string());
            args.push(days.to_string());
        }
        args
    }

    /// The same invocation with the recency filter dropped, used for the
    /// one-shot automatic recovery after `NoRecentTargets`.
    pub fn broadened(&self) -> Self {
        let mut opts = self.clone();
        opts.recent_days = None;
        opts
    }

    /// Short command rendering for session bookkeeping and error messages.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.command_args());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadened_drops_recency_filter() {
        let mut opts = ScanOptions::new("worker");
        opts.args = vec!["--country".into(), "US".into()];
        opts.recent_days = Some(90);

        assert!(opts
            .command_args()
            .windows(2)
            .any(|w| w[0] == "--recent-days" && w[1] == "90"));

        let broad = opts.broadened();
        assert_eq!(broad.args, opts.args);
        assert!(!broad.command_args().iter().any(|a| a == "--recent-days"));
    }
}
