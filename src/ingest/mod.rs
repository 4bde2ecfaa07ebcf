//! Trace ingestion
//!
//! Parses a closed grammar-trace document into a [`GenerationTrace`].
//!
//! ```text
//! {"trace_version": "1.0",
//!  "events": [
//!    {"type": "token_filtering", "step": 0,
//!     "data": {"candidates_before": [{"token": 1, "p": 0.4, "logit": 2.0, "str": "{"}],
//!              "candidates_after":  [...],
//!              "rejected_count": 3}},
//!    {"type": "token_accepted", "step": 0, "data": {"token": 1, "token_str": "{"}}]}
//! ```
//!
//! Only a missing `events` array (or unparsable JSON) is fatal. Everything
//! else that looks wrong is reported as a [`SchemaWarning`] and ingestion
//! carries on.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, TracerError};
use crate::model::{
    AcceptedEvent, Candidate, FilteringEvent, GenerationTrace, TokenId, TraceEvent, MAX_DENSE_STEPS,
};
use crate::sentinel::{nullable_logit, substitute_neg_inf};

/// Version reported when the document carries no `trace_version`
pub const UNKNOWN_VERSION: &str = "unknown";

// =============================================================================
// WARNINGS
// =============================================================================

/// Non-fatal structural problem found while ingesting or validating a trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaWarning {
    /// Document has no `trace_version`
    MissingVersion,
    /// Highest step is too large to walk densely; gaps go unreported
    SparseSteps {
        /// Highest step seen
        generation_steps: usize,
    },
    /// Event type tag is absent or not one we understand; event skipped
    UnknownEventType {
        /// Position in the raw events array
        index: usize,
        /// The tag found, if any
        tag: Option<String>,
    },
    /// Event payload has the wrong shape; event skipped
    MalformedEvent {
        /// Position in the raw events array
        index: usize,
        /// Parser diagnostic
        reason: String,
    },
    /// No filtering event for a step
    MissingFilteringEvent {
        /// Step number
        step: usize,
    },
    /// No accepted event for a step
    MissingAcceptedEvent {
        /// Step number
        step: usize,
    },
    /// Accepted token does not appear in the step's after-set
    AcceptedTokenNotInCandidates {
        /// Step number
        step: usize,
        /// Accepted token
        token: TokenId,
    },
    /// Reported `rejected_count` differs from the computed set difference
    RejectedCountMismatch {
        /// Step number
        step: usize,
        /// Count reported by the engine (kept authoritative)
        reported: usize,
        /// Size of before-ids minus after-ids
        computed: usize,
    },
}

impl fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVersion => write!(f, "trace_version not found in trace file"),
            Self::SparseSteps { generation_steps } => write!(
                f,
                "Highest step {generation_steps} exceeds {MAX_DENSE_STEPS}; only recorded steps are processed"
            ),
            Self::UnknownEventType { index, tag } => match tag {
                Some(tag) => write!(f, "Event {index}: Unknown event type: {tag}"),
                None => write!(f, "Event {index}: Missing event type"),
            },
            Self::MalformedEvent { index, reason } => {
                write!(f, "Event {index}: Malformed event data: {reason}")
            },
            Self::MissingFilteringEvent { step } => {
                write!(f, "Step {step}: Missing token_filtering event")
            },
            Self::MissingAcceptedEvent { step } => {
                write!(f, "Step {step}: Missing token_accepted event")
            },
            Self::AcceptedTokenNotInCandidates { step, token } => write!(
                f,
                "Step {step}: Accepted token {token} not found in candidates_after"
            ),
            Self::RejectedCountMismatch {
                step,
                reported,
                computed,
            } => write!(
                f,
                "Step {step}: rejected_count {reported} disagrees with computed rejections {computed}"
            ),
        }
    }
}

// =============================================================================
// RAW WIRE FORMAT
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawTraceDocument {
    #[serde(default, deserialize_with = "crate::lenient::optional_string")]
    trace_version: Option<String>,
    #[serde(default)]
    events: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    step: usize,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    token: TokenId,
    #[serde(default)]
    p: Option<f64>,
    #[serde(default, deserialize_with = "nullable_logit")]
    logit: f64,
    #[serde(rename = "str", default)]
    text: Option<String>,
}

impl From<RawCandidate> for Candidate {
    fn from(raw: RawCandidate) -> Self {
        Candidate::new(raw.token, raw.text, raw.logit, raw.p)
    }
}

#[derive(Debug, Deserialize)]
struct RawFilteringData {
    #[serde(default)]
    candidates_before: Vec<RawCandidate>,
    #[serde(default)]
    candidates_after: Vec<RawCandidate>,
    #[serde(default)]
    rejected_count: usize,
}

#[derive(Debug, Deserialize)]
struct RawAcceptedData {
    #[serde(default)]
    token: TokenId,
    #[serde(default)]
    token_str: Option<String>,
}

/// Event type tags understood by the ingestor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `token_filtering`
    TokenFiltering,
    /// `token_accepted`
    TokenAccepted,
}

impl EventKind {
    /// Map a wire tag to a kind
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "token_filtering" => Some(Self::TokenFiltering),
            "token_accepted" => Some(Self::TokenAccepted),
            _ => None,
        }
    }

    /// Wire tag
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::TokenFiltering => "token_filtering",
            Self::TokenAccepted => "token_accepted",
        }
    }
}

// =============================================================================
// INGESTOR
// =============================================================================

/// Result of ingesting one trace document
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The immutable trace
    pub trace: GenerationTrace,
    /// Warnings raised while reading the document
    pub warnings: Vec<SchemaWarning>,
}

/// Parser for grammar trace documents
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceIngestor;

impl TraceIngestor {
    /// Create an ingestor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Read and ingest a trace file
    ///
    /// # Errors
    ///
    /// `MissingInput` when the file does not exist, `Io` when it cannot be
    /// read, `MalformedDocument` when it is not a trace document.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Ingested> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TracerError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| TracerError::io(format!("Failed to read {}", path.display()), e))?;
        debug!(path = %path.display(), bytes = content.len(), "ingesting trace");
        self.parse_str(&content)
    }

    /// Ingest a trace document held in memory
    ///
    /// # Errors
    ///
    /// `MalformedDocument` when the JSON is invalid or has no `events` array.
    pub fn parse_str(&self, content: &str) -> Result<Ingested> {
        let content = substitute_neg_inf(content);
        let raw: RawTraceDocument = serde_json::from_str(&content)
            .map_err(|e| TracerError::malformed("Invalid JSON in trace file", e))?;

        let mut warnings = Vec::new();
        let version = match raw.trace_version {
            Some(v) => v,
            None => {
                warnings.push(SchemaWarning::MissingVersion);
                UNKNOWN_VERSION.to_string()
            },
        };

        let raw_events = raw.events.ok_or_else(|| TracerError::MalformedDocument {
            reason: "No events found in trace file".to_string(),
        })?;

        let mut events = Vec::with_capacity(raw_events.len());
        for (index, raw_event) in raw_events.into_iter().enumerate() {
            match Self::parse_event(index, raw_event) {
                Ok(event) => events.push(event),
                Err(warning) => warnings.push(warning),
            }
        }

        let trace = GenerationTrace::from_events(version, events);
        if trace.is_sparse() {
            warnings.push(SchemaWarning::SparseSteps {
                generation_steps: trace.generation_steps(),
            });
        }

        for warning in &warnings {
            warn!("{warning}");
        }

        Ok(Ingested { trace, warnings })
    }

    fn parse_event(index: usize, raw: Value) -> std::result::Result<TraceEvent, SchemaWarning> {
        let malformed = |e: serde_json::Error| SchemaWarning::MalformedEvent {
            index,
            reason: e.to_string(),
        };

        let envelope: RawEvent = serde_json::from_value(raw).map_err(malformed)?;
        let Some(kind) = envelope.kind.as_deref().and_then(EventKind::from_tag) else {
            return Err(SchemaWarning::UnknownEventType {
                index,
                tag: envelope.kind,
            });
        };
        let data = envelope
            .data
            .filter(|d| !d.is_null())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        match kind {
            EventKind::TokenFiltering => {
                let data: RawFilteringData = serde_json::from_value(data).map_err(malformed)?;
                Ok(TraceEvent::Filtering(FilteringEvent::new(
                    envelope.step,
                    data.candidates_before.into_iter().map(Candidate::from).collect(),
                    data.candidates_after.into_iter().map(Candidate::from).collect(),
                    data.rejected_count,
                )))
            },
            EventKind::TokenAccepted => {
                let data: RawAcceptedData = serde_json::from_value(data).map_err(malformed)?;
                Ok(TraceEvent::Accepted(AcceptedEvent::new(
                    envelope.step,
                    data.token,
                    data.token_str.unwrap_or_default(),
                )))
            },
        }
    }

    /// Check per-step integrity over every step the trace walks
    ///
    /// Never fails: every finding is a warning.
    #[must_use]
    pub fn validate(&self, trace: &GenerationTrace) -> Vec<SchemaWarning> {
        let mut warnings = Vec::new();

        for step in trace.steps() {
            let summary = trace.step_summary(step);

            if summary.filtering.is_none() {
                warnings.push(SchemaWarning::MissingFilteringEvent { step });
            }
            if summary.accepted.is_none() {
                warnings.push(SchemaWarning::MissingAcceptedEvent { step });
            }
            if let (Some(filtering), Some(accepted)) = (summary.filtering, summary.accepted) {
                if !filtering.allows(accepted.token()) {
                    warnings.push(SchemaWarning::AcceptedTokenNotInCandidates {
                        step,
                        token: accepted.token(),
                    });
                }
            }
        }

        for event in trace.filtering_events() {
            if let Some(computed) = event.rejected_count_divergence() {
                warnings.push(SchemaWarning::RejectedCountMismatch {
                    step: event.step(),
                    reported: event.rejected_count(),
                    computed,
                });
            }
        }

        warnings
    }
}
