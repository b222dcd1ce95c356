use std::time::Duration;

use thiserror::Error;

/// Infrastructure failures of the coordination engine itself.
///
/// Worker failures that can be classified from output (missing targets,
/// authentication, dependencies) are not errors at this level; they surface
/// inside the [`crate::types::ScanReport`]. Cancellation is a distinct
/// non-error status.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Another live process already holds the scan lock. Never retried
    /// automatically.
    #[error("another scan is already active (owner pid {owner_pid})")]
    LockHeld { owner_pid: u32 },

    /// The worker executable could not be spawned at all.
    #[error("failed to launch scan worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The session exceeded its configured timeout; the process group has
    /// already been killed by the time this surfaces.
    #[error("scan worker timed out after {}", format_duration(.0))]
    Timeout(Duration),

    /// Lock file or process plumbing I/O that could not be worked around.
    #[error("scan coordination I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render a duration the way an operator would say it ("90 seconds",
/// "30 minutes"), for timeout messages.
pub fn format_duration(d: &Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{} ms", d.as_millis());
    }
    if secs >= 3600 && secs % 3600 == 0 {
        let h = secs / 3600;
        format!("{} hour{}", h, if h == 1 { "" } else { "s" })
    } else if secs >= 60 && secs % 60 == 0 {
        let m = secs / 60;
        format!("{} minute{}", m, if m == 1 { "" } else { "s" })
    } else {
        format!("{} seconds", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_render_in_operator_units() {
        assert_eq!(format_duration(&Duration::from_millis(400)), "400 ms");
        assert_eq!(format_duration(&Duration::from_secs(90)), "90 seconds");
        assert_eq!(format_duration(&Duration::from_secs(120)), "2 minutes");
        assert_eq!(format_duration(&Duration::from_secs(3600)), "1 hour");
    }

    #[test]
    fn timeout_error_names_the_duration() {
        let err = ScanError::Timeout(Duration::from_secs(1800));
        assert_eq!(err.to_string(), "scan worker timed out after 30 minutes");
    }
}
