//! Probability recovery from raw logits
//!
//! Computes softmax(x) = exp(x - max(x)) / sum(exp(x - max(x))) over the
//! complete candidate set. Truncation for display always happens after
//! normalization; truncating first would inflate the surviving entries.

use serde::Serialize;

use crate::model::{Candidate, TokenId};

/// Decimal places kept in the structured export
pub const PROBABILITY_DECIMALS: i32 = 4;

/// A candidate together with its recovered probability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedCandidate {
    /// Token identifier
    pub token: TokenId,
    /// Recovered probability
    pub prob: f64,
    /// Raw logit
    pub logit: f64,
    /// Display text
    #[serde(rename = "str")]
    pub text: String,
}

/// Numerically stable softmax
///
/// Non-finite logits (masked tokens) get probability 0. When nothing is
/// left to normalize, every probability is 0 rather than NaN.
#[must_use]
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| if l.is_finite() { (l - max).exp() } else { 0.0 })
        .collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }

    exps.into_iter().map(|e| e / sum).collect()
}

/// Normalize a full candidate set, preserving candidate order
#[must_use]
pub fn normalize(candidates: &[Candidate]) -> Vec<NormalizedCandidate> {
    let logits: Vec<f64> = candidates.iter().map(Candidate::logit).collect();
    candidates
        .iter()
        .zip(softmax(&logits))
        .map(|(c, prob)| NormalizedCandidate {
            token: c.id(),
            prob,
            logit: c.logit(),
            text: c.text().to_string(),
        })
        .collect()
}

/// Sort by probability, highest first; ties keep their original order
pub fn sort_by_probability(candidates: &mut [NormalizedCandidate]) {
    candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));
}

/// Normalize over the full set, then keep the `k` most probable
#[must_use]
pub fn top_k(candidates: &[Candidate], k: usize) -> Vec<NormalizedCandidate> {
    let mut normalized = normalize(candidates);
    sort_by_probability(&mut normalized);
    normalized.truncate(k);
    normalized
}

/// Recovered probability of `token`, or 0.0 when it is not in the set
#[must_use]
pub fn probability_of(normalized: &[NormalizedCandidate], token: TokenId) -> f64 {
    normalized
        .iter()
        .find(|c| c.token == token)
        .map_or(0.0, |c| c.prob)
}

/// Round to [`PROBABILITY_DECIMALS`] places
#[must_use]
pub fn round_probability(p: f64) -> f64 {
    let scale = 10f64.powi(PROBABILITY_DECIMALS);
    (p * scale).round() / scale
}
