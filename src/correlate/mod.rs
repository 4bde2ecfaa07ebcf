//! Correlation of token telemetry with rejection-sampling telemetry
//!
//! Joins an OpenAI-style chat completion (per-position token, logprob and
//! top alternatives) with a rejection log written by the constrained
//! decoding engine. The join key is the step number: position `i` of the
//! completion's `logprobs.content` matches the rejection entry with
//! `step == i`. The same algorithm serves the offline `merge` command and
//! the proxy's online path.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, TracerError};
use crate::export::write_pretty_json;
use crate::lenient::{optional_f64, optional_i64, optional_step, optional_string};
use crate::sentinel::substitute_neg_inf;

/// Placeholder for absent identifiers and versions
pub const UNKNOWN: &str = "unknown";

/// Note for a step the grammar accepted on first sample
pub const NOTE_NOT_REJECTED: &str = "Token was grammar-valid on first sample, no rejection occurred";

/// Note for a step when no rejection telemetry was observed
pub const NOTE_NO_TELEMETRY: &str = "No rejection telemetry was available for this request";

/// Default offline merge output
pub const DEFAULT_MERGE_OUTPUT: &str = "combined_output.json";

// =============================================================================
// API RESPONSE DOCUMENT
// =============================================================================

/// Chat completion response, reduced to the fields the correlator reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    /// Request identifier
    #[serde(default, deserialize_with = "optional_string")]
    pub id: Option<String>,
    /// Model name
    #[serde(default, deserialize_with = "optional_string")]
    pub model: Option<String>,
    /// Creation time (unix seconds)
    #[serde(default, deserialize_with = "optional_i64")]
    pub created: Option<i64>,
    /// Completion choices; only the first is read
    #[serde(default)]
    pub choices: Vec<ApiChoice>,
}

/// One completion choice
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiChoice {
    /// Assistant message
    #[serde(default)]
    pub message: Option<ApiMessage>,
    /// Per-token telemetry
    #[serde(default)]
    pub logprobs: Option<ApiLogprobs>,
}

/// Assistant message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMessage {
    /// Message text
    #[serde(default, deserialize_with = "optional_string")]
    pub content: Option<String>,
}

/// Logprobs block of a choice
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiLogprobs {
    /// One entry per generated position
    #[serde(default)]
    pub content: Vec<TokenLogprob>,
}

/// Telemetry for one generated position
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenLogprob {
    /// Token id (engine extension, may be absent)
    #[serde(default)]
    pub id: Value,
    /// Token text
    #[serde(default, deserialize_with = "optional_string")]
    pub token: Option<String>,
    /// UTF-8 bytes of the token
    #[serde(default)]
    pub bytes: Value,
    /// Log probability; `null` when the engine reported negative infinity
    #[serde(default, deserialize_with = "optional_f64")]
    pub logprob: Option<f64>,
    /// Alternatives, carried through verbatim
    #[serde(default)]
    pub top_logprobs: Option<Value>,
}

impl ApiResponse {
    /// Parse a response body, substituting the `-inf` sentinel first
    ///
    /// # Errors
    ///
    /// `MalformedDocument` when the body is not a JSON object of the expected shape.
    pub fn parse_str(content: &str) -> Result<Self> {
        serde_json::from_str(&substitute_neg_inf(content))
            .map_err(|e| TracerError::malformed("Invalid API response", e))
    }

    fn first_choice(&self) -> Option<&ApiChoice> {
        self.choices.first()
    }

    /// Per-position token telemetry of the first choice
    #[must_use]
    pub fn token_logprobs(&self) -> &[TokenLogprob] {
        self.first_choice()
            .and_then(|c| c.logprobs.as_ref())
            .map(|l| l.content.as_slice())
            .unwrap_or_default()
    }

    /// Assistant message content of the first choice, or empty
    #[must_use]
    pub fn final_output(&self) -> &str {
        self.first_choice()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
            .unwrap_or("")
    }
}

// =============================================================================
// REJECTION LOG DOCUMENT
// =============================================================================

/// Rejection log as written by the decoding engine
///
/// Entries are read one by one: an entry that is not an object is dropped
/// with a warning and the rest of the log stays readable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawRejectionLog")]
pub struct RejectionLog {
    /// Log format version
    pub log_version: Option<Value>,
    /// Time the log was opened
    pub timestamp: Option<Value>,
    /// Entries in write order
    pub events: Vec<RejectionLogEntry>,
}

#[derive(Debug, Deserialize)]
struct RawRejectionLog {
    #[serde(default)]
    log_version: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    events: Option<Vec<Value>>,
}

impl From<RawRejectionLog> for RejectionLog {
    fn from(raw: RawRejectionLog) -> Self {
        let events = raw
            .events
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match serde_json::from_value(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(index, "rejection entry dropped: {e}");
                    None
                },
            })
            .collect();
        Self {
            log_version: raw.log_version,
            timestamp: raw.timestamp,
            events,
        }
    }
}

/// One resample record
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RejectionLogEntry {
    /// Generation step; entries without a non-negative integer step cannot be joined
    #[serde(default, deserialize_with = "optional_step")]
    pub step: Option<usize>,
    /// Engine task identifier
    #[serde(default)]
    pub task_id: Value,
    /// Engine slot identifier
    #[serde(default)]
    pub slot_id: Value,
    /// The sample the grammar refused
    #[serde(default)]
    pub rejected: Value,
    /// Candidates before masking
    #[serde(default)]
    pub pre_masking: Option<Value>,
    /// Candidates after the grammar constraint
    #[serde(default)]
    pub post_grammar: Option<Value>,
    /// Candidates after the full sampler chain
    #[serde(default)]
    pub post_chain: Option<Value>,
    /// The replacement sample
    #[serde(default)]
    pub resampled: Value,
}

impl RejectionLogEntry {
    /// Task identifier as an integer, when the engine wrote one
    #[must_use]
    pub fn task(&self) -> Option<i64> {
        self.task_id.as_i64()
    }
}

impl RejectionLog {
    /// Parse a rejection log, substituting the `-inf` sentinel first
    ///
    /// # Errors
    ///
    /// `MalformedDocument` when the content is not a rejection log.
    pub fn parse_str(content: &str) -> Result<Self> {
        serde_json::from_str(&substitute_neg_inf(content))
            .map_err(|e| TracerError::malformed("Invalid rejection log", e))
    }
}

/// Whether rejection telemetry was observed for the request being merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryCoverage {
    /// The log was read; a missing entry means the first sample was grammar-valid
    Available,
    /// The log was never readable; a missing entry means nothing is known
    Unavailable,
}

impl TelemetryCoverage {
    /// Note attached to a step without a rejection entry
    #[must_use]
    pub fn note(self) -> &'static str {
        match self {
            Self::Available => NOTE_NOT_REJECTED,
            Self::Unavailable => NOTE_NO_TELEMETRY,
        }
    }
}

/// Rejection entries indexed by step
#[derive(Debug, Clone)]
pub struct RejectionSet<'a> {
    by_step: BTreeMap<usize, &'a RejectionLogEntry>,
    coverage: TelemetryCoverage,
}

impl<'a> RejectionSet<'a> {
    /// Index entries by step; on duplicate steps the last entry wins
    pub fn new(entries: impl IntoIterator<Item = &'a RejectionLogEntry>, coverage: TelemetryCoverage) -> Self {
        let mut by_step = BTreeMap::new();
        for entry in entries {
            match entry.step {
                Some(step) => {
                    if by_step.insert(step, entry).is_some() {
                        debug!(step, "duplicate rejection entry, keeping the later one");
                    }
                },
                None => warn!(task_id = %entry.task_id, "rejection entry without step ignored"),
            }
        }
        Self { by_step, coverage }
    }

    /// A set with no telemetry at all
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            by_step: BTreeMap::new(),
            coverage: TelemetryCoverage::Unavailable,
        }
    }

    /// Entry for `step`, if one was logged
    #[must_use]
    pub fn get(&self, step: usize) -> Option<&'a RejectionLogEntry> {
        self.by_step.get(&step).copied()
    }

    /// Number of distinct steps with an entry
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_step.len()
    }

    /// Whether no step has an entry
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_step.is_empty()
    }

    /// Coverage of this set
    #[must_use]
    pub fn coverage(&self) -> TelemetryCoverage {
        self.coverage
    }
}

// =============================================================================
// COMBINED DOCUMENT
// =============================================================================

/// Source identifiers and timestamps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedMetadata {
    /// API response id
    pub request_id: String,
    /// Model name
    pub model: String,
    /// API creation time
    pub created: i64,
    /// Rejection log version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_log_version: Option<Value>,
    /// Rejection log timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_log_timestamp: Option<Value>,
    /// Time the combined document was generated (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Token identity carried through from the API response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenTelemetry {
    /// Token id
    pub id: Value,
    /// Token text
    pub text: Option<String>,
    /// Token bytes
    pub bytes: Value,
    /// Log probability
    pub logprob: Option<f64>,
}

/// Rejection detail, or the explained absence of one
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionSampling {
    /// The first sample was refused and replaced
    Rejected {
        /// Engine task identifier
        task_id: Value,
        /// Engine slot identifier
        slot_id: Value,
        /// Refused sample
        rejected: Value,
        /// Candidates before masking
        pre_masking: Value,
        /// Candidates after the grammar constraint
        post_grammar: Value,
        /// Candidates after the full sampler chain
        post_chain: Value,
        /// Replacement sample
        resampled: Value,
    },
    /// No rejection entry for this step
    NotRejected {
        /// Why there is no entry
        note: &'static str,
    },
}

impl RejectionSampling {
    fn from_entry(entry: &RejectionLogEntry) -> Self {
        let snapshot = |v: &Option<Value>| v.clone().unwrap_or_else(|| Value::Array(Vec::new()));
        Self::Rejected {
            task_id: entry.task_id.clone(),
            slot_id: entry.slot_id.clone(),
            rejected: entry.rejected.clone(),
            pre_masking: snapshot(&entry.pre_masking),
            post_grammar: snapshot(&entry.post_grammar),
            post_chain: snapshot(&entry.post_chain),
            resampled: entry.resampled.clone(),
        }
    }

    /// Whether this step was resampled
    #[must_use]
    pub fn was_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl Serialize for RejectionSampling {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Rejected {
                task_id,
                slot_id,
                rejected,
                pre_masking,
                post_grammar,
                post_chain,
                resampled,
            } => {
                let mut map = serializer.serialize_map(Some(8))?;
                map.serialize_entry("task_id", task_id)?;
                map.serialize_entry("slot_id", slot_id)?;
                map.serialize_entry("was_rejected", &true)?;
                map.serialize_entry("rejected", rejected)?;
                map.serialize_entry("pre_masking", pre_masking)?;
                map.serialize_entry("post_grammar", post_grammar)?;
                map.serialize_entry("post_chain", post_chain)?;
                map.serialize_entry("resampled", resampled)?;
                map.end()
            },
            Self::NotRejected { note } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("was_rejected", &false)?;
                map.serialize_entry("note", note)?;
                map.end()
            },
        }
    }
}

/// One generated position with both telemetry streams
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedStep {
    /// Position index
    pub step: usize,
    /// Token identity
    pub token: TokenTelemetry,
    /// Verbatim top alternatives from the API
    pub api_top_logprobs: Value,
    /// Rejection detail or its absence
    pub rejection_sampling: RejectionSampling,
}

/// Merge summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedSummary {
    /// Positions in the API document
    pub total_steps: usize,
    /// Positions with a rejection entry
    pub rejected_steps: usize,
    /// `rejected_steps / total_steps`, 0.0 when there are no steps
    pub rejection_rate: f64,
    /// Assembled assistant output
    pub final_output: String,
}

/// Result of correlating one API response with rejection telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedDocument {
    /// Source identifiers
    pub metadata: CombinedMetadata,
    /// One entry per API position
    pub steps: Vec<CombinedStep>,
    /// Counts and final text
    pub summary: CombinedSummary,
}

/// Rejection rate, defined as 0.0 when `total` is 0
#[must_use]
pub fn rejection_rate(rejected: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        rejected as f64 / total as f64
    }
}

/// Join every API position with its rejection entry
#[must_use]
pub fn correlate(api: &ApiResponse, rejections: &RejectionSet<'_>) -> CombinedDocument {
    let steps: Vec<CombinedStep> = api
        .token_logprobs()
        .iter()
        .enumerate()
        .map(|(step, entry)| CombinedStep {
            step,
            token: TokenTelemetry {
                id: entry.id.clone(),
                text: entry.token.clone(),
                bytes: entry.bytes.clone(),
                logprob: entry.logprob,
            },
            api_top_logprobs: entry
                .top_logprobs
                .clone()
                .unwrap_or_else(|| Value::Array(Vec::new())),
            rejection_sampling: rejections.get(step).map_or(
                RejectionSampling::NotRejected {
                    note: rejections.coverage().note(),
                },
                RejectionSampling::from_entry,
            ),
        })
        .collect();

    let total_steps = steps.len();
    let rejected_steps = steps
        .iter()
        .filter(|s| s.rejection_sampling.was_rejected())
        .count();

    CombinedDocument {
        metadata: CombinedMetadata {
            request_id: api.id.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            model: api.model.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            created: api.created.unwrap_or(0),
            rejection_log_version: None,
            rejection_log_timestamp: None,
            timestamp: None,
        },
        steps,
        summary: CombinedSummary {
            total_steps,
            rejected_steps,
            rejection_rate: rejection_rate(rejected_steps, total_steps),
            final_output: api.final_output().to_string(),
        },
    }
}

/// Offline merge of an API response with a complete rejection log
#[must_use]
pub fn merge_documents(api: &ApiResponse, log: &RejectionLog) -> CombinedDocument {
    let rejections = RejectionSet::new(&log.events, TelemetryCoverage::Available);
    let mut combined = correlate(api, &rejections);
    let unknown = || Value::String(UNKNOWN.to_string());
    combined.metadata.rejection_log_version = Some(log.log_version.clone().unwrap_or_else(unknown));
    combined.metadata.rejection_log_timestamp = Some(log.timestamp.clone().unwrap_or_else(unknown));
    combined
}

// =============================================================================
// FILE LOADING
// =============================================================================

fn load_document<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    if !path.exists() {
        return Err(TracerError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    let bytes = std::fs::read(path)
        .map_err(|e| TracerError::io(format!("Failed to read {}", path.display()), e))?;
    let content = String::from_utf8_lossy(&bytes);
    serde_json::from_str(&substitute_neg_inf(&content))
        .map_err(|e| TracerError::malformed(format!("Invalid {what} in {}", path.display()), e))
}

/// Load an API response from disk
///
/// # Errors
///
/// `MissingInput`, `Io` or `MalformedDocument`.
pub fn load_api_response(path: impl AsRef<Path>) -> Result<ApiResponse> {
    load_document(path.as_ref(), "API response")
}

/// Load a rejection log from disk
///
/// # Errors
///
/// `MissingInput`, `Io` or `MalformedDocument`.
pub fn load_rejection_log(path: impl AsRef<Path>) -> Result<RejectionLog> {
    load_document(path.as_ref(), "rejection log")
}

/// Load both inputs, merge them and write the combined document to `output`
///
/// # Errors
///
/// Any load error, or `Io` when the output cannot be written.
pub fn merge_files(
    api_path: impl AsRef<Path>,
    log_path: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<CombinedDocument> {
    let api = load_api_response(api_path.as_ref())?;
    let log = load_rejection_log(log_path.as_ref())?;
    debug!(entries = log.events.len(), "rejection log loaded");

    let combined = merge_documents(&api, &log);
    write_pretty_json(output.as_ref(), &combined)?;
    info!(
        path = %output.as_ref().display(),
        steps = combined.summary.total_steps,
        rejected = combined.summary.rejected_steps,
        "combined output saved"
    );
    Ok(combined)
}
