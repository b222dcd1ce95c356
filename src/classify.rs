//! Post-exit interpretation of the worker's captured output: statistics
//! extraction on success, sentinel-phrase failure classification otherwise.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::progress::strip_ansi;
use crate::types::{Failure, FailureKind, ScanStats};

/// Worker sentinel: nothing to scan inside the recency window. The
/// coordinator may broaden the scope and retry once.
pub const NO_RECENT_TARGETS_SENTINEL: &str = "No authenticated hosts found from the last";

/// Worker sentinel: the requested targets have no established authentication.
pub const NOT_AUTHENTICATED_SENTINEL: &str = "None of the specified servers are authenticated";

/// Worker sentinels indicating missing runtime libraries.
const MISSING_DEPENDENCY_MARKERS: &[&str] = &["scan libraries not available", "No module named"];

/// Substrings that mark a line as error context for generic failures.
const ERROR_INDICATORS: &[&str] = &[
    "error:",
    "failed:",
    "exception:",
    "traceback",
    "invalid",
    "missing",
    "not found",
];

/// How many context lines a generic failure carries.
const ERROR_CONTEXT_LINES: usize = 3;

/// Terminal interpretation of one worker run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Cancellation was requested before the process exited; exit code and
    /// output are irrelevant.
    Cancelled,
    Completed {
        stats: ScanStats,
        /// False when no statistics could be extracted; the caller may fall
        /// back to an external data source.
        stats_found: bool,
    },
    Failed(Failure),
}

/// Interpret the full captured output and exit code of a finished worker.
/// Cancellation takes priority over everything else.
pub fn finalize(full_output: &str, exit_code: Option<i32>, cancel_requested: bool) -> Outcome {
    if cancel_requested {
        return Outcome::Cancelled;
    }
    match exit_code {
        Some(0) => {
            let (stats, stats_found) = parse_final_stats(full_output);
            if !stats_found {
                warn!("worker exited cleanly but no statistics could be extracted from its output");
            }
            Outcome::Completed { stats, stats_found }
        }
        code => Outcome::Failed(classify_failure(full_output, code)),
    }
}

/// Extract final statistics via labeled-field lookups, accepting both the
/// current label vocabulary and the legacy one and reconciling them.
pub fn parse_final_stats(output: &str) -> (ScanStats, bool) {
    let cleaned = strip_ansi(output);
    let patterns = stat_patterns();

    let hosts_scanned = grab_count(&patterns.hosts_scanned, &cleaned);
    let hosts_accessible = grab_count(&patterns.hosts_accessible, &cleaned);
    let accessible_shares = grab_count(&patterns.accessible_shares, &cleaned);
    let hosts_tested = grab_count(&patterns.hosts_tested, &cleaned);
    let successful_auth = grab_count(&patterns.successful_auth, &cleaned);
    let session_id = patterns
        .session_id
        .captures(&cleaned)
        .map(|caps| caps[1].to_string());

    let found = [
        hosts_scanned,
        hosts_accessible,
        accessible_shares,
        hosts_tested,
        successful_auth,
    ]
    .iter()
    .any(Option::is_some)
        || session_id.is_some();

    let stats = ScanStats {
        hosts_scanned: hosts_scanned.or(hosts_tested).unwrap_or(0),
        hosts_accessible: hosts_accessible.or(successful_auth).unwrap_or(0),
        accessible_shares: accessible_shares.unwrap_or(0),
        session_id,
    };
    (stats, found)
}

/// Classify a non-zero exit by scanning for sentinel phrases, falling back
/// to generic error-context extraction.
pub fn classify_failure(output: &str, exit_code: Option<i32>) -> Failure {
    let cleaned = strip_ansi(output);

    for line in cleaned.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.contains(NO_RECENT_TARGETS_SENTINEL) {
            return Failure {
                kind: FailureKind::NoRecentTargets,
                detail: line.to_string(),
                exit_code,
            };
        }
        if line.contains(NOT_AUTHENTICATED_SENTINEL) {
            return Failure {
                kind: FailureKind::TargetsNotAuthenticated,
                detail: line.to_string(),
                exit_code,
            };
        }
        if MISSING_DEPENDENCY_MARKERS.iter().any(|m| line.contains(m)) {
            return Failure {
                kind: FailureKind::MissingRuntimeDependency,
                detail: format!(
                    "The scan worker is missing required runtime libraries. \
                     This usually means it is running outside its expected \
                     environment; reinstall the worker's dependencies and retry.\n\
                     Worker output: {line}"
                ),
                exit_code,
            };
        }
    }

    Failure {
        kind: FailureKind::Generic,
        detail: generic_context(&cleaned, exit_code),
        exit_code,
    }
}

/// Error context for unclassified failures: the first few indicator lines,
/// else the last few non-empty lines verbatim.
fn generic_context(cleaned: &str, exit_code: Option<i32>) -> String {
    let error_lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            ERROR_INDICATORS.iter().any(|ind| lower.contains(ind))
        })
        .take(ERROR_CONTEXT_LINES)
        .collect();
    if !error_lines.is_empty() {
        return error_lines.join("\n");
    }

    let non_empty: Vec<&str> = cleaned.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if !non_empty.is_empty() {
        let tail = &non_empty[non_empty.len().saturating_sub(ERROR_CONTEXT_LINES)..];
        return tail.join("\n");
    }

    match exit_code {
        Some(code) => format!("scan worker exited with code {code} and produced no output"),
        None => "scan worker was killed by a signal and produced no output".to_string(),
    }
}

fn grab_count(pattern: &Regex, text: &str) -> Option<u64> {
    let caps = pattern.captures(text)?;
    caps[1].replace(',', "").parse().ok()
}

struct StatPatterns {
    hosts_scanned: Regex,
    hosts_accessible: Regex,
    accessible_shares: Regex,
    hosts_tested: Regex,
    successful_auth: Regex,
    session_id: Regex,
}

static STAT_PATTERNS: OnceLock<StatPatterns> = OnceLock::new();

fn stat_patterns() -> &'static StatPatterns {
    STAT_PATTERNS.get_or_init(|| StatPatterns {
        // Current vocabulary (emoji prefixes vary; match on the label).
        hosts_scanned: Regex::new(r"Hosts Scanned:\s*(\d[\d,]*)").unwrap(),
        hosts_accessible: Regex::new(r"Hosts Accessible:\s*(\d[\d,]*)").unwrap(),
        accessible_shares: Regex::new(r"Accessible Shares:\s*(\d[\d,]*)").unwrap(),
        // Legacy vocabulary from older workers.
        hosts_tested: Regex::new(r"Hosts Tested:\s*(\d[\d,]*)").unwrap(),
        successful_auth: Regex::new(r"Successful Auth:\s*(\d[\d,]*)").unwrap(),
        session_id: Regex::new(r"session:\s*(\d+)").unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_vocabulary_is_extracted() {
        let output = "🎉 assessment complete\n📊 Hosts Scanned: 1,204\n🔓 Hosts Accessible: 17\n📁 Accessible Shares: 42\n";
        let (stats, found) = parse_final_stats(output);
        assert!(found);
        assert_eq!(stats.hosts_scanned, 1204);
        assert_eq!(stats.hosts_accessible, 17);
        assert_eq!(stats.accessible_shares, 42);
    }

    #[test]
    fn legacy_vocabulary_reconciles_into_canonical_fields() {
        let output = "Hosts Tested: 50\nSuccessful Auth: 9\nFailed Auth: 41\nsession: 1234\n";
        let (stats, found) = parse_final_stats(output);
        assert!(found);
        assert_eq!(stats.hosts_scanned, 50);
        assert_eq!(stats.hosts_accessible, 9);
        assert_eq!(stats.session_id.as_deref(), Some("1234"));
    }

    #[test]
    fn missing_statistics_are_flagged_not_fatal() {
        let (stats, found) = parse_final_stats("nothing useful here\n");
        assert!(!found);
        assert_eq!(stats, ScanStats::default());
    }

    #[test]
    fn sentinel_phrases_classify_failures() {
        let f = classify_failure(
            "✗ No authenticated hosts found from the last 90 days\n",
            Some(1),
        );
        assert_eq!(f.kind, FailureKind::NoRecentTargets);

        let f = classify_failure(
            "✗ None of the specified servers are authenticated\n",
            Some(1),
        );
        assert_eq!(f.kind, FailureKind::TargetsNotAuthenticated);

        let f = classify_failure("ImportError: No module named 'smbclient'\n", Some(1));
        assert_eq!(f.kind, FailureKind::MissingRuntimeDependency);
        assert!(f.detail.contains("missing required runtime libraries"));
    }

    #[test]
    fn generic_failure_surfaces_last_lines_verbatim() {
        let output = "starting up\ndoing things\n\nsomething broke badly\n";
        let f = classify_failure(output, Some(2));
        assert_eq!(f.kind, FailureKind::Generic);
        assert!(f.detail.contains("something broke badly"));
    }

    #[test]
    fn cancellation_beats_exit_code_interpretation() {
        let outcome = finalize("📊 Hosts Scanned: 10\n", Some(0), true);
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[test]
    fn clean_exit_with_stats_completes() {
        let outcome = finalize("📊 Hosts Scanned: 10\n", Some(0), false);
        match outcome {
            Outcome::Completed { stats, stats_found } => {
                assert!(stats_found);
                assert_eq!(stats.hosts_scanned, 10);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
