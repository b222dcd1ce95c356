#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scan_runner_rs::coordinator::ScanCoordinator;
use scan_runner_rs::error::ScanError;
use scan_runner_rs::progress::ProgressUpdate;
use scan_runner_rs::types::{FailureKind, ScanOptions, SessionStatus};

fn write_worker(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn progress_recorder() -> (
    Arc<Mutex<Vec<ProgressUpdate>>>,
    impl Fn(ProgressUpdate) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        move |update: ProgressUpdate| seen.lock().unwrap().push(update)
    };
    (seen, sink)
}

#[tokio::test]
async fn two_phase_worker_completes_with_stats() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_worker(
        dir.path(),
        "worker.sh",
        r#"echo '[1/2] Phase A'
echo '5/10 (50%)'
echo '8/10 (80%)'
echo '10/10 (100%)'
echo '[2/2] Phase B'
echo 'Hosts Scanned: 12'
exit 0"#,
    );

    let coordinator = ScanCoordinator::new(dir.path());
    let options = ScanOptions::new(&worker);
    let (seen, on_progress) = progress_recorder();
    let logged = Arc::new(Mutex::new(Vec::new()));
    let log_sink = {
        let logged = Arc::clone(&logged);
        move |line: &str| logged.lock().unwrap().push(line.to_string())
    };

    let report = coordinator
        .run_scan(&options, on_progress, log_sink)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert!(report.success());
    assert!(report.stats_found);
    assert_eq!(report.stats.hosts_scanned, 12);
    assert!(!report.recovery_attempted);
    assert!(report.raw_output.contains("Hosts Scanned: 12"));

    // Every line reached the log sink, in order.
    let logged = logged.lock().unwrap();
    assert_eq!(logged.len(), 6);
    assert_eq!(logged[0], "[1/2] Phase A");
    assert_eq!(logged[5], "Hosts Scanned: 12");

    // Strictly increasing percentages, capped short of Phase A's boundary
    // on the 100% sample, then jumping into Phase B's range.
    let pcts: Vec<f64> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|u| u.percentage)
        .collect();
    assert_eq!(pcts.len(), 5);
    for pair in pcts.windows(2) {
        assert!(pair[1] > pair[0], "expected strict increase in {pcts:?}");
    }
    assert!(pcts[3] < 50.0);
    assert!(pcts[4] >= 50.0);

    // Lock released; session recorded as completed.
    assert!(!coordinator.is_scan_active());
    let session = coordinator.session().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.end_time.is_some());
}

#[tokio::test]
async fn no_recent_targets_recovers_exactly_once_with_broadened_scope() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = dir.path().join("invocations.log");
    let worker = write_worker(
        dir.path(),
        "worker.sh",
        r#"echo "run $@" >> "$INVOCATION_LOG"
echo '✗ No authenticated hosts found from the last 90 days'
exit 1"#,
    );

    let coordinator = ScanCoordinator::new(dir.path());
    let mut options = ScanOptions::new(&worker);
    options.recent_days = Some(90);
    options.env = vec![(
        "INVOCATION_LOG".to_string(),
        invocations.display().to_string(),
    )];

    let report = coordinator
        .run_scan(&options, |_| {}, |_| {})
        .await
        .unwrap();

    // Both attempts failed, so the failure surfaces, but only after the
    // single broadened retry, never a second one.
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(report.recovery_attempted);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::NoRecentTargets);

    let log = fs::read_to_string(&invocations).unwrap();
    let runs: Vec<&str> = log.lines().collect();
    assert_eq!(runs.len(), 2, "expected exactly two worker invocations");
    assert!(runs[0].contains("--recent-days 90"));
    assert!(!runs[1].contains("--recent-days"));
}

#[tokio::test]
async fn successful_recovery_masks_the_original_failure() {
    let dir = tempfile::tempdir().unwrap();
    // Fails with the recency sentinel only when the filter is present.
    let worker = write_worker(
        dir.path(),
        "worker.sh",
        r#"case "$*" in
*--recent-days*)
    echo '✗ No authenticated hosts found from the last 30 days'
    exit 1
    ;;
esac
echo 'Hosts Scanned: 7'
echo 'Hosts Accessible: 2'
exit 0"#,
    );

    let coordinator = ScanCoordinator::new(dir.path());
    let mut options = ScanOptions::new(&worker);
    options.recent_days = Some(30);

    let report = coordinator
        .run_scan(&options, |_| {}, |_| {})
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert!(report.recovery_attempted);
    assert_eq!(report.stats.hosts_scanned, 7);
    assert_eq!(report.stats.hosts_accessible, 2);
}

#[tokio::test]
async fn cancellation_terminates_a_term_trapping_worker_within_bounds() {
    let dir = tempfile::tempdir().unwrap();
    // Ignores SIGTERM and keeps respawning sleeps; only the forced group
    // kill can end it.
    let worker = write_worker(
        dir.path(),
        "worker.sh",
        r#"trap "" TERM
echo 'ℹ starting long scan'
while :; do sleep 1; done"#,
    );

    let coordinator = Arc::new(
        ScanCoordinator::new(dir.path())
            .with_grace_period(Duration::from_millis(300))
            .with_kill_wait(Duration::from_secs(2)),
    );
    let mut options = ScanOptions::new(&worker);
    options.scan_kind = "long".to_string();

    let runner = Arc::clone(&coordinator);
    let task = tokio::spawn(async move { runner.run_scan(&options, |_| {}, |_| {}).await });

    // Let the session start, then cancel from "another thread".
    tokio::time::sleep(Duration::from_millis(500)).await;
    let cancelled_at = Instant::now();
    coordinator.cancel_scan();
    coordinator.cancel_scan(); // idempotent

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert!(report.cancelled());
    assert_eq!(report.summary, "Scan cancelled by user");
    // Bounded by grace + kill + join with generous headroom.
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
    assert!(!coordinator.is_scan_active());
}

#[tokio::test]
async fn timeout_kills_the_worker_and_names_the_duration() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_worker(dir.path(), "worker.sh", "sleep 30");

    let coordinator = ScanCoordinator::new(dir.path());
    let mut options = ScanOptions::new(&worker);
    options.timeout = Some(Duration::from_millis(400));

    let started = Instant::now();
    let err = coordinator
        .run_scan(&options, |_| {}, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Timeout(_)));
    assert!(err.to_string().contains("timed out after"));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(!coordinator.is_scan_active());
    let session = coordinator.session().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
}

#[tokio::test]
async fn missing_worker_is_a_launch_failure_and_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = ScanCoordinator::new(dir.path());
    let options = ScanOptions::new(dir.path().join("no-such-worker"));

    let err = coordinator
        .run_scan(&options, |_| {}, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Launch { .. }));
    assert!(!coordinator.is_scan_active());
}

#[tokio::test]
async fn concurrent_start_is_rejected_while_a_session_runs() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_worker(dir.path(), "worker.sh", "sleep 30");

    let first = Arc::new(ScanCoordinator::new(dir.path()));
    let options = ScanOptions::new(&worker);

    let runner = Arc::clone(&first);
    let opts = options.clone();
    let task = tokio::spawn(async move { runner.run_scan(&opts, |_| {}, |_| {}).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(first.is_scan_active());

    // An independent coordinator over the same directory sees the live lock.
    let second = ScanCoordinator::new(dir.path());
    let err = second
        .run_scan(&options, |_| {}, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::LockHeld { .. }));

    first.cancel_scan();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.status, SessionStatus::Cancelled);
}
