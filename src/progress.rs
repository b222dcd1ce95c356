//! Phase-aware interpretation of worker output lines into a monotonic
//! overall percentage.
//!
//! The worker writes free-form text. A few line shapes carry progress
//! information and are parsed best-effort; everything else is ignored here
//! (the raw line still reaches the log sink upstream). Parsing never fails
//! loudly; malformed input degrades to "no update".

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

/// Named, ordered stages of a scan. Each maps to a fixed sub-range of the
/// overall 0–100 scale so that per-phase percentages from the worker can be
/// projected onto one global bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    Authentication,
    AccessTesting,
    Collection,
    Reporting,
}

impl Phase {
    pub const ORDERED: [Phase; 5] = [
        Phase::Discovery,
        Phase::Authentication,
        Phase::AccessTesting,
        Phase::Collection,
        Phase::Reporting,
    ];

    /// `[start, end)` slice of the overall percentage scale. Access testing
    /// dominates wall-clock time and gets the widest slice.
    pub fn range(self) -> (f64, f64) {
        match self {
            Phase::Discovery => (5.0, 15.0),
            Phase::Authentication => (15.0, 25.0),
            Phase::AccessTesting => (25.0, 80.0),
            Phase::Collection => (80.0, 95.0),
            Phase::Reporting => (95.0, 100.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Authentication => "authentication",
            Phase::AccessTesting => "access_testing",
            Phase::Collection => "collection",
            Phase::Reporting => "reporting",
        }
    }

    /// Only the terminal phase may drive the bar to its end value.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Reporting)
    }

    /// Keyword inference, checked in phase order so "Testing SMB
    /// authentication" resolves to authentication, not access testing.
    fn from_keywords(text: &str) -> Option<Phase> {
        let lower = text.to_lowercase();
        for phase in Phase::ORDERED {
            let keywords: &[&str] = match phase {
                Phase::Discovery => &["discovery", "shodan", "query"],
                Phase::Authentication => &["authentication", "auth", "login"],
                Phase::AccessTesting => &["testing", "processing", "host"],
                Phase::Collection => &["collection", "enumerat", "share"],
                Phase::Reporting => &["report", "summary", "complete"],
            };
            if keywords.iter().any(|k| lower.contains(k)) {
                return Some(phase);
            }
        }
        None
    }
}

/// Catch-all range used before any phase has ever been detected.
const GENERIC_RANGE: (f64, f64) = (5.0, 95.0);

/// Non-terminal samples stop this far short of their phase boundary, so a
/// "last item at 100%" report cannot fake overall completion.
const CAP_MARGIN: f64 = 0.5;

/// Forward nudge applied instead of an apparent regression once the display
/// has stalled, and the ceiling it may never cross.
const STALL_NUDGE: f64 = 0.5;
const NUDGE_CEILING: f64 = 99.0;

const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(30);

/// Step headers beyond this many steps are treated as per-item counters,
/// not workflow markers ("[37/120] Testing 10.0.0.37" is not a phase).
const STEP_HEADER_MAX_TOTAL: u64 = 12;

/// One progress event pushed to the caller's sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Overall percentage, monotonic within a session. `None` for
    /// message-only updates.
    pub percentage: Option<f64>,
    pub message: String,
    pub phase: Option<String>,
}

/// The phase currently believed active: either a known phase from the table
/// or one synthesized from a step header with an unrecognized name.
#[derive(Debug, Clone)]
struct ActivePhase {
    label: String,
    start: f64,
    end: f64,
    terminal: bool,
}

impl ActivePhase {
    fn known(phase: Phase) -> Self {
        let (start, end) = phase.range();
        Self {
            label: phase.name().to_string(),
            start,
            end,
            terminal: phase.is_terminal(),
        }
    }

    /// Even split of the overall scale for workers whose step names match
    /// nothing in the table: step N of M owns `[(N-1)/M, N/M) * 100`.
    fn synthesized(step: u64, total: u64, name: &str) -> Self {
        let total = total.max(1);
        let step = step.clamp(1, total);
        Self {
            label: name.trim().to_string(),
            start: (step - 1) as f64 / total as f64 * 100.0,
            end: step as f64 / total as f64 * 100.0,
            terminal: step == total,
        }
    }
}

/// Recognized line shapes, in match priority order.
#[derive(Debug, Clone, PartialEq)]
enum LineEvent {
    /// `[N/M] <name>` workflow marker.
    StepHeader { step: u64, total: u64, name: String },
    /// `X/Y (P%)` item counter, with or without a `Progress:` prefix.
    Counter { current: u64, total: u64, percent: f64 },
    /// Severity glyph plus free text.
    Status { text: String },
}

/// Per-session progress state machine. Create a fresh one per session.
#[derive(Debug)]
pub struct ProgressInterpreter {
    active: Option<ActivePhase>,
    last_percentage: f64,
    last_update: Instant,
    stall_after: Duration,
}

impl Default for ProgressInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressInterpreter {
    pub fn new() -> Self {
        Self::with_stall_threshold(DEFAULT_STALL_AFTER)
    }

    /// Override the stall duration after which an apparent regression turns
    /// into a small forward nudge.
    pub fn with_stall_threshold(stall_after: Duration) -> Self {
        Self {
            active: None,
            last_percentage: 0.0,
            last_update: Instant::now(),
            stall_after,
        }
    }

    /// The last percentage pushed to the sink.
    pub fn last_percentage(&self) -> f64 {
        self.last_percentage
    }

    /// Interpret one output line. Returns `None` for lines that carry no
    /// progress information.
    pub fn feed(&mut self, raw_line: &str) -> Option<ProgressUpdate> {
        let stripped = strip_ansi(raw_line);
        let line = stripped.trim();
        if line.is_empty() {
            return None;
        }

        match parse_line(line)? {
            LineEvent::StepHeader { step, total, name } => {
                let phase = Phase::from_keywords(&name)
                    .map(ActivePhase::known)
                    .unwrap_or_else(|| ActivePhase::synthesized(step, total, &name));
                let start = phase.start;
                let label = phase.label.clone();
                self.active = Some(phase);
                let percentage = self.monotonic(start);
                Some(ProgressUpdate {
                    percentage: Some(percentage),
                    message: format!("Step {step}/{total}: {name}"),
                    phase: Some(label),
                })
            }
            LineEvent::Counter {
                current,
                total,
                percent,
            } => {
                if let Some(phase) = Phase::from_keywords(line) {
                    self.active = Some(ActivePhase::known(phase));
                }
                let (start, end, terminal, label) = self.current_range();
                let mut mapped = start + (percent.clamp(0.0, 100.0) / 100.0) * (end - start);
                if !terminal {
                    // Containment: a non-terminal phase never reaches its
                    // boundary, including on the final item of a batch.
                    mapped = mapped.min(end - CAP_MARGIN);
                }
                let percentage = self.monotonic(mapped);
                let message = if line.to_lowercase().contains("recent") {
                    format!("Testing recent hosts: {current}/{total}")
                } else {
                    format!("Processing {current}/{total} hosts")
                };
                Some(ProgressUpdate {
                    percentage: Some(percentage),
                    message,
                    phase: label,
                })
            }
            LineEvent::Status { text } => {
                if let Some(phase) = Phase::from_keywords(&text) {
                    self.active = Some(ActivePhase::known(phase));
                }
                let estimate = self.estimate_status(&text);
                let percentage = estimate.map(|p| self.monotonic(p));
                let phase = self.active.as_ref().map(|p| p.label.clone());
                Some(ProgressUpdate {
                    percentage,
                    message: text,
                    phase,
                })
            }
        }
    }

    /// Active phase range, or the generic catch-all before any detection.
    fn current_range(&self) -> (f64, f64, bool, Option<String>) {
        match &self.active {
            Some(p) => (p.start, p.end, p.terminal, Some(p.label.clone())),
            None => (GENERIC_RANGE.0, GENERIC_RANGE.1, false, None),
        }
    }

    /// Keyword heuristic for glyph status lines: rough position within the
    /// active phase. Error-ish lines and phase-less sessions estimate
    /// nothing (message-only update).
    fn estimate_status(&self, text: &str) -> Option<f64> {
        let lower = text.to_lowercase();
        if lower.contains("failed") || lower.contains("error") {
            return None;
        }
        let phase = self.active.as_ref()?;
        let ceiling = if phase.terminal {
            phase.end
        } else {
            phase.end - CAP_MARGIN
        };
        let estimate = if lower.contains("starting") || lower.contains("initializing") {
            phase.start
        } else if lower.contains("complete") || lower.contains("finished") {
            phase.start + 20.0
        } else if lower.contains("processing") || lower.contains("working") {
            phase.start + 10.0
        } else if lower.contains("found") {
            phase.start + 5.0
        } else {
            phase.start
        };
        Some(estimate.min(ceiling))
    }

    /// Monotonicity guard: regressions re-report the previous value, unless
    /// the display has stalled past the threshold, in which case the value
    /// is nudged forward as a liveness signal.
    fn monotonic(&mut self, candidate: f64) -> f64 {
        let now = Instant::now();
        let value = if candidate < self.last_percentage {
            if now.duration_since(self.last_update) > self.stall_after {
                (self.last_percentage + STALL_NUDGE).min(NUDGE_CEILING)
            } else {
                self.last_percentage
            }
        } else {
            candidate
        };
        self.last_percentage = value;
        self.last_update = now;
        value
    }
}

fn parse_line(line: &str) -> Option<LineEvent> {
    if let Some(caps) = step_header_pattern().captures(line) {
        let step: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        if step >= 1 && step <= total && total <= STEP_HEADER_MAX_TOTAL {
            return Some(LineEvent::StepHeader {
                step,
                total,
                name: caps[3].trim().to_string(),
            });
        }
        // Falls through: large [N/M] prefixes are per-item markers and the
        // rest of the line may still carry a counter.
    }
    if let Some(caps) = counter_pattern().captures(line) {
        let current: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        let percent: f64 = caps[3].parse().ok()?;
        return Some(LineEvent::Counter {
            current,
            total,
            percent,
        });
    }
    if let Some(caps) = status_pattern().captures(line) {
        return Some(LineEvent::Status {
            text: caps[1].trim().to_string(),
        });
    }
    None
}

/// Strip ANSI color sequences; the worker colors its output for terminals.
pub(crate) fn strip_ansi(line: &str) -> String {
    ansi_pattern().replace_all(line, "").into_owned()
}

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();
static STEP_HEADER_PATTERN: OnceLock<Regex> = OnceLock::new();
static COUNTER_PATTERN: OnceLock<Regex> = OnceLock::new();
static STATUS_PATTERN: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap())
}

fn step_header_pattern() -> &'static Regex {
    STEP_HEADER_PATTERN.get_or_init(|| Regex::new(r"^\[(\d+)/(\d+)\]\s*(\S.*)$").unwrap())
}

fn counter_pattern() -> &'static Regex {
    COUNTER_PATTERN.get_or_init(|| Regex::new(r"(\d+)/(\d+)\s*\((\d+(?:\.\d+)?)%\)").unwrap())
}

fn status_pattern() -> &'static Regex {
    STATUS_PATTERN.get_or_init(|| Regex::new(r"^[ℹ✓⚠✗🚀]\s*(\S.*)$").unwrap())
}
