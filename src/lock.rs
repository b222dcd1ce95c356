//! Cross-process single-flight coordination via an on-disk lock artifact.
//!
//! The lock is a small JSON file whose presence means "a scan is running".
//! It is not an OS lock primitive: a record whose owner process is dead is
//! stale and reclaimable, so a crash mid-scan can never wedge the system.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::process;

/// Well-known lock file name, relative to the coordinator's directory.
pub const LOCK_FILE_NAME: &str = ".scan_lock";

/// Contents of the lock artifact. Presence of the file *is* the lock; the
/// record only exists so probes can show who holds it and since when.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub start_time: String,
    pub scan_kind: String,
    pub scope: Option<String>,
    pub owner_pid: u32,
}

/// Handle to the lock artifact for one coordinator directory.
#[derive(Debug, Clone)]
pub struct ScanLock {
    path: PathBuf,
}

/// Releases the lock on drop, so every exit path of a session (including
/// panics and dropped futures) deletes the record.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a ScanLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl ScanLock {
    /// Lock artifact handle rooted in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock for this process.
    ///
    /// Fails fast with [`ScanError::LockHeld`] when a record with a live
    /// owner exists. Stale records (dead owner) and corrupt records are
    /// deleted and acquisition proceeds. Never blocks.
    pub fn acquire(
        &self,
        scan_kind: &str,
        scope: Option<&str>,
    ) -> Result<LockGuard<'_>, ScanError> {
        if let Some(record) = self.live_owner() {
            return Err(ScanError::LockHeld {
                owner_pid: record.owner_pid,
            });
        }

        let record = LockRecord {
            start_time: now_rfc3339(),
            scan_kind: scan_kind.to_string(),
            scope: scope.map(str::to_string),
            owner_pid: std::process::id(),
        };

        // `create_new` makes the file's appearance atomic; the record body
        // follows in a single write. A reader that catches the sub-millisecond
        // gap sees a corrupt record and treats it as "no valid lock", which
        // the data model allows.
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the creation race to another acquirer.
                let owner_pid = self.read_record().map(|r| r.owner_pid).unwrap_or(0);
                return Err(ScanError::LockHeld { owner_pid });
            }
            Err(e) => return Err(e.into()),
        };

        let body = serde_json::to_string_pretty(&record)
            .expect("lock record serializes to JSON");
        file.write_all(body.as_bytes())?;
        debug!(path = %self.path.display(), pid = record.owner_pid, "scan lock acquired");
        Ok(LockGuard { lock: self })
    }

    /// Delete the lock artifact unconditionally. Best-effort: a missing file
    /// or a filesystem refusal must not take down a finishing session.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "scan lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove scan lock"),
        }
    }

    /// Is a scan currently active according to the artifact?
    ///
    /// Applies the same staleness logic as [`ScanLock::acquire`]: a record
    /// with a dead owner is removed and reported as inactive.
    pub fn is_active(&self) -> bool {
        self.live_owner().is_some()
    }

    /// Parsed record access for operator-facing display. `None` when absent
    /// or unreadable.
    pub fn read_record(&self) -> Option<LockRecord> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Startup sweep: drop a leftover artifact whose owner died. Safe to
    /// call at any time; keeps valid locks intact.
    pub fn cleanup_stale(&self) {
        let _ = self.live_owner();
    }

    /// The record, if it exists and its owner is still running. Deletes
    /// stale and corrupt records as a side effect.
    fn live_owner(&self) -> Option<LockRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return None,
        };
        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) if process::process_alive(record.owner_pid) => Some(record),
            Ok(record) => {
                debug!(owner_pid = record.owner_pid, "removing stale scan lock");
                self.release();
                None
            }
            Err(e) => {
                // Corrupt or partially written: not a valid lock, never fatal.
                warn!(path = %self.path.display(), error = %e, "removing corrupt scan lock");
                self.release();
                None
            }
        }
    }
}

/// RFC3339 UTC timestamp for lock records and session bookkeeping.
pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
