//! Rejection statistics and decision-point detection
//!
//! The probability shift of a filtering event is the probability mass, under
//! the before-filter distribution recovered from logits, of the tokens the
//! grammar removed. Steps whose shift exceeds a threshold are decision
//! points: the grammar overrode what the model wanted to say.

use serde::Serialize;

use crate::model::{FilteringEvent, GenerationTrace};
use crate::probability::{normalize, sort_by_probability, NormalizedCandidate};

/// Default probability-shift threshold for decision points
pub const DEFAULT_DECISION_THRESHOLD: f64 = 0.3;

/// Rejected candidates listed per decision point
pub const TOP_REJECTED_LIMIT: usize = 5;

/// Mean of a slice, 0.0 when empty
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Probability mass removed by the grammar at this event, in `[0, 1]`
#[must_use]
pub fn probability_shift(event: &FilteringEvent) -> f64 {
    let rejected = event.rejected_ids();
    let shift: f64 = normalize(event.candidates_before())
        .iter()
        .filter(|c| rejected.contains(&c.token))
        .map(|c| c.prob)
        .sum();
    shift.clamp(0.0, 1.0)
}

/// Rejected candidates with their before-filter probability, most probable first
#[must_use]
pub fn rejected_by_probability(event: &FilteringEvent) -> Vec<NormalizedCandidate> {
    let rejected = event.rejected_ids();
    let mut candidates: Vec<NormalizedCandidate> = normalize(event.candidates_before())
        .into_iter()
        .filter(|c| rejected.contains(&c.token))
        .collect();
    sort_by_probability(&mut candidates);
    candidates
}

/// A step where grammar filtering removed a large share of probability mass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionPoint {
    /// Generation step
    pub step: usize,
    /// Removed probability mass
    pub prob_shift: f64,
    /// Reported rejected count
    pub rejections: usize,
    /// Most probable rejected candidates
    pub top_rejected: Vec<NormalizedCandidate>,
}

impl DecisionPoint {
    /// Evaluate one filtering event against `threshold`
    #[must_use]
    pub fn detect(event: &FilteringEvent, threshold: f64) -> Option<Self> {
        let prob_shift = probability_shift(event);
        if prob_shift <= threshold {
            return None;
        }
        let mut top_rejected = rejected_by_probability(event);
        top_rejected.truncate(TOP_REJECTED_LIMIT);
        Some(Self {
            step: event.step(),
            prob_shift,
            rejections: event.rejected_count(),
            top_rejected,
        })
    }
}

/// Decision points over the representative filtering event of every step
#[must_use]
pub fn decision_points(trace: &GenerationTrace, threshold: f64) -> Vec<DecisionPoint> {
    trace
        .steps()
        .filter_map(|step| trace.step_summary(step).filtering)
        .filter_map(|event| DecisionPoint::detect(event, threshold))
        .collect()
}

/// Aggregate statistics over filtering events
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceStatistics {
    /// Number of filtering events
    pub total_filtering_events: usize,
    /// Mean reported rejected count
    pub avg_rejections_per_step: f64,
    /// Largest reported rejected count
    pub max_rejections_in_step: usize,
    /// Mean probability shift
    pub avg_prob_shift: f64,
    /// Largest probability shift
    pub max_prob_shift: f64,
}

impl TraceStatistics {
    /// Compute statistics; all zero when there are no events
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a FilteringEvent>) -> Self {
        let mut rejections = Vec::new();
        let mut shifts = Vec::new();
        for event in events {
            rejections.push(event.rejected_count());
            shifts.push(probability_shift(event));
        }
        if rejections.is_empty() {
            return Self::default();
        }

        let rejection_values: Vec<f64> = rejections.iter().map(|&r| r as f64).collect();
        Self {
            total_filtering_events: rejections.len(),
            avg_rejections_per_step: mean(&rejection_values),
            max_rejections_in_step: rejections.iter().copied().max().unwrap_or(0),
            avg_prob_shift: mean(&shifts),
            max_prob_shift: shifts.iter().copied().fold(0.0, f64::max),
        }
    }

    /// Statistics over every filtering event of a trace
    #[must_use]
    pub fn for_trace(trace: &GenerationTrace) -> Self {
        Self::from_events(trace.filtering_events())
    }
}
