//! Export serializers
//!
//! Two document shapes are produced from a [`GenerationTrace`]:
//!
//! - **Dashboard export**: metadata, statistics, decision points and a
//!   per-step timeline with the top candidates on each side of the filter.
//! - **Structured export**: a flat array of per-step records giving the
//!   accepted token, its post-filter probability and the `top_k` most
//!   probable alternatives.
//!
//! Every probability is recovered over the complete candidate set before
//! any truncation.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{Result, TracerError};
use crate::model::{GenerationTrace, TokenId};
use crate::probability::{normalize, probability_of, round_probability, top_k, NormalizedCandidate};
use crate::stats::{decision_points, probability_shift, DecisionPoint, TraceStatistics};

/// Candidates kept per side of a timeline entry
pub const TIMELINE_CANDIDATE_LIMIT: usize = 20;

/// Default alternatives per structured record
pub const DEFAULT_TOP_K: usize = 5;

// =============================================================================
// DASHBOARD EXPORT
// =============================================================================

/// Trace-level metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardMetadata {
    /// Trace format version
    pub trace_version: String,
    /// Highest step in the trace
    pub generation_steps: usize,
    /// Number of accepted tokens
    pub total_tokens: usize,
    /// Sum of reported rejected counts
    pub total_rejections: usize,
}

/// Filtering detail attached to a timeline entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineFiltering {
    /// Most probable candidates before filtering
    pub candidates_before: Vec<NormalizedCandidate>,
    /// Most probable candidates after filtering
    pub candidates_after: Vec<NormalizedCandidate>,
    /// Reported rejected count
    pub rejected_count: usize,
    /// Removed probability mass
    pub prob_shift: f64,
}

/// One step of the dashboard timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    /// Step number
    pub step: usize,
    /// Accepted token text, if any
    pub token: Option<String>,
    /// Accepted token id, if any
    pub token_id: Option<TokenId>,
    /// Present only when the step has a filtering event
    #[serde(flatten)]
    pub filtering: Option<TimelineFiltering>,
}

/// Complete dashboard document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardExport {
    /// Trace-level metadata
    pub metadata: DashboardMetadata,
    /// Aggregate rejection statistics
    pub statistics: TraceStatistics,
    /// High-impact steps
    pub decision_points: Vec<DecisionPoint>,
    /// Per-step view over `0..=generation_steps`
    pub timeline: Vec<TimelineEntry>,
    /// Concatenated accepted texts
    pub generated_text: String,
}

/// Build the timeline for every step of the trace
#[must_use]
pub fn build_timeline(trace: &GenerationTrace) -> Vec<TimelineEntry> {
    trace
        .steps()
        .map(|step| {
            let summary = trace.step_summary(step);
            let filtering = summary.filtering.map(|event| TimelineFiltering {
                candidates_before: top_k(event.candidates_before(), TIMELINE_CANDIDATE_LIMIT),
                candidates_after: top_k(event.candidates_after(), TIMELINE_CANDIDATE_LIMIT),
                rejected_count: event.rejected_count(),
                prob_shift: probability_shift(event),
            });
            TimelineEntry {
                step,
                token: summary.accepted.map(|a| a.text().to_string()),
                token_id: summary.accepted.map(|a| a.token()),
                filtering,
            }
        })
        .collect()
}

/// Build the dashboard document without writing it
#[must_use]
pub fn build_dashboard(trace: &GenerationTrace, threshold: f64) -> DashboardExport {
    DashboardExport {
        metadata: DashboardMetadata {
            trace_version: trace.version().to_string(),
            generation_steps: trace.generation_steps(),
            total_tokens: trace.generated_tokens().len(),
            total_rejections: trace.total_rejections(),
        },
        statistics: TraceStatistics::for_trace(trace),
        decision_points: decision_points(trace, threshold),
        timeline: build_timeline(trace),
        generated_text: trace.generated_text(),
    }
}

/// Build the dashboard document and write it to `path`
///
/// # Errors
///
/// `Io` when the file cannot be written.
pub fn export_for_dashboard(
    trace: &GenerationTrace,
    path: impl AsRef<Path>,
    threshold: f64,
) -> Result<DashboardExport> {
    let export = build_dashboard(trace, threshold);
    write_pretty_json(path.as_ref(), &export)?;
    info!(path = %path.as_ref().display(), steps = export.timeline.len(), "dashboard export written");
    Ok(export)
}

// =============================================================================
// STRUCTURED EXPORT
// =============================================================================

/// A token alternative with its rounded probability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProbability {
    /// Token text
    pub token: String,
    /// Probability rounded to four decimals
    pub probability: f64,
}

/// One step of the structured export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredStep {
    /// Step number
    pub step: usize,
    /// Accepted token text
    pub accepted_token: String,
    /// Post-filter probability of the accepted token; 0.0 when it is not in the after-set
    pub accepted_probability: f64,
    /// Most probable post-filter alternatives, non-increasing
    pub all_tokens: Vec<TokenProbability>,
}

/// Build structured records for every step with both a filtering and an accepted event
#[must_use]
pub fn build_structured(trace: &GenerationTrace, k: usize) -> Vec<StructuredStep> {
    trace
        .steps()
        .filter_map(|step| {
            let summary = trace.step_summary(step);
            let (filtering, accepted) = (summary.filtering?, summary.accepted?);

            let normalized = normalize(filtering.candidates_after());
            let accepted_probability = probability_of(&normalized, accepted.token());
            let all_tokens = top_k(filtering.candidates_after(), k)
                .into_iter()
                .map(|c| TokenProbability {
                    token: c.text,
                    probability: round_probability(c.prob),
                })
                .collect();

            Some(StructuredStep {
                step,
                accepted_token: accepted.text().to_string(),
                accepted_probability: round_probability(accepted_probability),
                all_tokens,
            })
        })
        .collect()
}

/// Build the structured export, write it to `path` and return the records
///
/// # Errors
///
/// `Io` when the file cannot be written.
pub fn export_structured(
    trace: &GenerationTrace,
    path: impl AsRef<Path>,
    k: usize,
) -> Result<Vec<StructuredStep>> {
    let records = build_structured(trace, k);
    write_pretty_json(path.as_ref(), &records)?;
    info!(path = %path.as_ref().display(), records = records.len(), top_k = k, "structured export written");
    Ok(records)
}

/// Serialize `value` with two-space indentation and write it to `path`
///
/// # Errors
///
/// `Io` when serialization or the write fails.
pub fn write_pretty_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| TracerError::Io {
        message: format!("Failed to serialize {}: {e}", path.display()),
    })?;
    std::fs::write(path, json)
        .map_err(|e| TracerError::io(format!("Failed to write {}", path.display()), e))
}
