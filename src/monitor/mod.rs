//! Tail monitor for the rejection log
//!
//! Watches a log file that the decoding engine is appending to while a
//! request is in flight, and returns the entries that belong to that
//! request. Each poll reads the whole file, substitutes the `-inf`
//! sentinel and tries a strict parse; when the writer is caught mid-write
//! the text is repaired (see [`repair_truncated`]) and parsed again.
//!
//! The monitor blocks the calling thread between polls. Async callers run
//! it on a blocking worker.
//!
//! Known limitation: the engine does not report its task identifier at the
//! HTTP boundary, so [`CorrelationKey::MostRecentTask`] attributes the most
//! recently appended task group to the request that just finished. This is
//! only correct with one correlated request in flight at a time.

mod repair;

pub use repair::repair_truncated;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace};

use crate::correlate::{RejectionLog, RejectionLogEntry, TelemetryCoverage};

/// Default delay between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait before giving up on a request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one read of the log
#[derive(Debug, Clone, PartialEq)]
pub enum ParseAttempt {
    /// The file parsed as-is
    Parsed(RejectionLog),
    /// The file parsed after closing a torn write
    Repaired(RejectionLog),
    /// Nothing usable yet (absent, empty or unrepairable)
    NotYetAvailable(String),
}

impl ParseAttempt {
    /// Parse log text, falling back to the torn-write repair
    #[must_use]
    pub fn from_content(content: &str) -> Self {
        if content.trim().is_empty() {
            return Self::NotYetAvailable("rejection log is empty".to_string());
        }
        let strict_err = match RejectionLog::parse_str(content) {
            Ok(log) => return Self::Parsed(log),
            Err(e) => e,
        };
        match repair_truncated(content).map(|fixed| RejectionLog::parse_str(&fixed)) {
            Some(Ok(log)) => Self::Repaired(log),
            Some(Err(e)) => Self::NotYetAvailable(e.to_string()),
            None => Self::NotYetAvailable(strict_err.to_string()),
        }
    }

    /// The parsed log, strict or repaired
    #[must_use]
    pub fn log(&self) -> Option<&RejectionLog> {
        match self {
            Self::Parsed(log) | Self::Repaired(log) => Some(log),
            Self::NotYetAvailable(_) => None,
        }
    }
}

/// How entries are attributed to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKey {
    /// Entries whose `task_id` equals this identifier
    Task(i64),
    /// Entries sharing the `task_id` of the last entry written
    MostRecentTask,
}

impl CorrelationKey {
    /// Select the entries matching this key, in log order
    #[must_use]
    pub fn select(&self, entries: &[RejectionLogEntry]) -> Vec<RejectionLogEntry> {
        match self {
            Self::Task(id) => entries
                .iter()
                .filter(|e| e.task() == Some(*id))
                .cloned()
                .collect(),
            Self::MostRecentTask => {
                let Some(latest) = entries.last() else {
                    return Vec::new();
                };
                entries
                    .iter()
                    .filter(|e| e.task_id == latest.task_id)
                    .cloned()
                    .collect()
            },
        }
    }
}

/// How a collection window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStatus {
    /// Matching entries were found
    Matched,
    /// The window elapsed without a match
    TimedOut,
}

/// Everything the monitor learned during one collection window
#[derive(Debug, Clone, PartialEq)]
pub struct TailOutcome {
    /// Entries attributed to the request
    pub entries: Vec<RejectionLogEntry>,
    /// `log_version` of the last readable log
    pub log_version: Option<Value>,
    /// `timestamp` of the last readable log
    pub log_timestamp: Option<Value>,
    /// How the window ended
    pub status: TailStatus,
    /// Reads made
    pub polls: usize,
    /// Whether the log was readable at least once
    pub log_observed: bool,
}

impl TailOutcome {
    /// Telemetry coverage implied by this outcome
    #[must_use]
    pub fn coverage(&self) -> TelemetryCoverage {
        if self.log_observed {
            TelemetryCoverage::Available
        } else {
            TelemetryCoverage::Unavailable
        }
    }
}

/// Poller over a concurrently written rejection log
#[derive(Debug, Clone)]
pub struct TailMonitor {
    path: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl TailMonitor {
    /// Create a monitor
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            timeout,
        }
    }

    /// Watched file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file once
    #[must_use]
    pub fn read_once(&self) -> ParseAttempt {
        match std::fs::read(&self.path) {
            Ok(bytes) => ParseAttempt::from_content(&String::from_utf8_lossy(&bytes)),
            Err(e) => ParseAttempt::NotYetAvailable(format!("{}: {e}", self.path.display())),
        }
    }

    /// Entries currently in the log (0 when it cannot be read)
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.read_once().log().map_or(0, |log| log.events.len())
    }

    /// Poll until entries matching `key` appear after `baseline`, or the timeout elapses
    ///
    /// Only entries at index `baseline` or later are considered; if the log
    /// has shrunk below `baseline` it is treated as rewritten and every entry
    /// is considered. A timeout is not an error: the outcome just carries no
    /// entries.
    #[must_use]
    pub fn collect(&self, key: CorrelationKey, baseline: usize) -> TailOutcome {
        let start = Instant::now();
        let mut outcome = TailOutcome {
            entries: Vec::new(),
            log_version: None,
            log_timestamp: None,
            status: TailStatus::TimedOut,
            polls: 0,
            log_observed: false,
        };

        loop {
            outcome.polls += 1;
            let attempt = self.read_once();
            match &attempt {
                ParseAttempt::Parsed(log) | ParseAttempt::Repaired(log) => {
                    if matches!(attempt, ParseAttempt::Repaired(_)) {
                        trace!(path = %self.path.display(), "read torn rejection log");
                    }
                    outcome.log_observed = true;
                    outcome.log_version.clone_from(&log.log_version);
                    outcome.log_timestamp.clone_from(&log.timestamp);

                    let from = if log.events.len() < baseline { 0 } else { baseline };
                    let entries = key.select(&log.events[from..]);
                    if !entries.is_empty() {
                        debug!(
                            entries = entries.len(),
                            polls = outcome.polls,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "rejection entries matched"
                        );
                        outcome.entries = entries;
                        outcome.status = TailStatus::Matched;
                        return outcome;
                    }
                },
                ParseAttempt::NotYetAvailable(reason) => {
                    trace!(%reason, "rejection log not yet available");
                },
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                break;
            }
            std::thread::sleep(self.poll_interval.min(self.timeout - elapsed));
        }

        debug!(polls = outcome.polls, key = ?key, "no rejection entries before timeout");
        outcome
    }
}
