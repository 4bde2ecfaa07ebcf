//! Event model for grammar-constrained generation traces
//!
//! Pure data: candidates, the two per-step event kinds the grammar engine
//! emits, and the immutable [`GenerationTrace`] built once per closed trace
//! document. Everything downstream (statistics, exports) reads these types
//! and never mutates them.

use std::collections::{BTreeMap, HashSet};

/// Vocabulary token identifier
pub type TokenId = u32;

/// Largest step count walked densely; beyond it only recorded steps are visited
pub const MAX_DENSE_STEPS: usize = 1 << 20;

/// A single token candidate considered by the sampler
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    id: TokenId,
    text: String,
    logit: f64,
    probability: Option<f64>,
}

impl Candidate {
    /// Create a candidate; a missing or empty text becomes `<token_{id}>`
    #[must_use]
    pub fn new(id: TokenId, text: Option<String>, logit: f64, probability: Option<f64>) -> Self {
        let text = match text {
            Some(t) if !t.is_empty() => t,
            _ => Self::placeholder_text(id),
        };
        Self {
            id,
            text,
            logit,
            probability,
        }
    }

    /// Synthetic display text for a token without one
    #[must_use]
    pub fn placeholder_text(id: TokenId) -> String {
        format!("<token_{id}>")
    }

    /// Token identifier
    #[must_use]
    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Display text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Raw logit (negative infinity when the engine masked the token)
    #[must_use]
    pub fn logit(&self) -> f64 {
        self.logit
    }

    /// Probability as reported by the engine, if any
    #[must_use]
    pub fn probability(&self) -> Option<f64> {
        self.probability
    }
}

/// Grammar filtering applied at one generation step
#[derive(Debug, Clone, PartialEq)]
pub struct FilteringEvent {
    step: usize,
    candidates_before: Vec<Candidate>,
    candidates_after: Vec<Candidate>,
    rejected_count: usize,
}

impl FilteringEvent {
    /// Create a filtering event. `rejected_count` is kept as reported.
    #[must_use]
    pub fn new(
        step: usize,
        candidates_before: Vec<Candidate>,
        candidates_after: Vec<Candidate>,
        rejected_count: usize,
    ) -> Self {
        Self {
            step,
            candidates_before,
            candidates_after,
            rejected_count,
        }
    }

    /// Generation step
    #[must_use]
    pub fn step(&self) -> usize {
        self.step
    }

    /// Candidates before the grammar constraint, in engine order
    #[must_use]
    pub fn candidates_before(&self) -> &[Candidate] {
        &self.candidates_before
    }

    /// Candidates surviving the grammar constraint, in engine order
    #[must_use]
    pub fn candidates_after(&self) -> &[Candidate] {
        &self.candidates_after
    }

    /// Rejected count as reported by the engine
    #[must_use]
    pub fn rejected_count(&self) -> usize {
        self.rejected_count
    }

    /// Identifiers present before filtering but absent after (set difference by id)
    #[must_use]
    pub fn rejected_ids(&self) -> HashSet<TokenId> {
        let after: HashSet<TokenId> = self.candidates_after.iter().map(Candidate::id).collect();
        self.candidates_before
            .iter()
            .map(Candidate::id)
            .filter(|id| !after.contains(id))
            .collect()
    }

    /// Rejected candidates in before-set order
    #[must_use]
    pub fn rejected_candidates(&self) -> Vec<&Candidate> {
        let rejected = self.rejected_ids();
        self.candidates_before
            .iter()
            .filter(|c| rejected.contains(&c.id()))
            .collect()
    }

    /// Whether `token` survived filtering
    #[must_use]
    pub fn allows(&self, token: TokenId) -> bool {
        self.candidates_after.iter().any(|c| c.id() == token)
    }

    /// Size of the computed rejected set when it disagrees with `rejected_count`
    #[must_use]
    pub fn rejected_count_divergence(&self) -> Option<usize> {
        let computed = self.rejected_ids().len();
        (computed != self.rejected_count).then_some(computed)
    }
}

/// Token chosen by the sampler at one generation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedEvent {
    step: usize,
    token: TokenId,
    text: String,
}

impl AcceptedEvent {
    /// Create an accepted-token event
    #[must_use]
    pub fn new(step: usize, token: TokenId, text: impl Into<String>) -> Self {
        Self {
            step,
            token,
            text: text.into(),
        }
    }

    /// Generation step
    #[must_use]
    pub fn step(&self) -> usize {
        self.step
    }

    /// Accepted token identifier
    #[must_use]
    pub fn token(&self) -> TokenId {
        self.token
    }

    /// Accepted token text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// One entry of the ordered event log
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// Grammar filtering snapshot
    Filtering(FilteringEvent),
    /// Sampler acceptance
    Accepted(AcceptedEvent),
}

impl TraceEvent {
    /// Step this event belongs to
    #[must_use]
    pub fn step(&self) -> usize {
        match self {
            Self::Filtering(e) => e.step(),
            Self::Accepted(e) => e.step(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StepSlots {
    filtering: Option<usize>,
    accepted: Option<usize>,
}

/// The events that describe one generation step
#[derive(Debug, Clone, Copy)]
pub struct StepSummary<'a> {
    /// Step number
    pub step: usize,
    /// Representative filtering event (largest before-set)
    pub filtering: Option<&'a FilteringEvent>,
    /// First accepted event at this step
    pub accepted: Option<&'a AcceptedEvent>,
}

impl<'a> StepSummary<'a> {
    /// Accepted token text, if the step has an acceptance
    #[must_use]
    pub fn token(&self) -> Option<&'a str> {
        self.accepted.map(AcceptedEvent::text)
    }
}

/// Complete, immutable trace of one generation
#[derive(Debug, Clone)]
pub struct GenerationTrace {
    version: String,
    events: Vec<TraceEvent>,
    generated_tokens: Vec<String>,
    generation_steps: usize,
    total_rejections: usize,
    step_index: BTreeMap<usize, StepSlots>,
}

impl GenerationTrace {
    /// Build a trace from an ordered event log, computing aggregates once
    #[must_use]
    pub fn from_events(version: impl Into<String>, events: Vec<TraceEvent>) -> Self {
        let generation_steps = events.iter().map(TraceEvent::step).max().unwrap_or(0);
        let mut total_rejections = 0;
        let mut generated_tokens = Vec::new();
        let mut step_index: BTreeMap<usize, StepSlots> = BTreeMap::new();

        for (idx, event) in events.iter().enumerate() {
            let slots = step_index.entry(event.step()).or_default();
            match event {
                TraceEvent::Filtering(f) => {
                    total_rejections += f.rejected_count();
                    // Multiple snapshots per step: the richest one wins, first on ties
                    let replace = match slots.filtering {
                        Some(current) => match &events[current] {
                            TraceEvent::Filtering(cur) => {
                                f.candidates_before().len() > cur.candidates_before().len()
                            },
                            TraceEvent::Accepted(_) => true,
                        },
                        None => true,
                    };
                    if replace {
                        slots.filtering = Some(idx);
                    }
                },
                TraceEvent::Accepted(a) => {
                    generated_tokens.push(a.text().to_string());
                    if slots.accepted.is_none() {
                        slots.accepted = Some(idx);
                    }
                },
            }
        }

        Self {
            version: version.into(),
            events,
            generated_tokens,
            generation_steps,
            total_rejections,
            step_index,
        }
    }

    /// Trace format version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Ordered event log
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Highest step seen across all events (0 for an empty trace)
    #[must_use]
    pub fn generation_steps(&self) -> usize {
        self.generation_steps
    }

    /// Sum of reported rejected counts over every filtering event
    #[must_use]
    pub fn total_rejections(&self) -> usize {
        self.total_rejections
    }

    /// Accepted token texts in event order
    #[must_use]
    pub fn generated_tokens(&self) -> &[String] {
        &self.generated_tokens
    }

    /// Concatenated accepted token texts
    #[must_use]
    pub fn generated_text(&self) -> String {
        self.generated_tokens.concat()
    }

    /// All filtering events in log order, including duplicates per step
    pub fn filtering_events(&self) -> impl Iterator<Item = &FilteringEvent> {
        self.events.iter().filter_map(|e| match e {
            TraceEvent::Filtering(f) => Some(f),
            TraceEvent::Accepted(_) => None,
        })
    }

    /// Whether `0..=generation_steps` is too wide to walk step by step
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.generation_steps >= MAX_DENSE_STEPS
    }

    /// Steps `0..=generation_steps`, or only the recorded steps when the trace is sparse
    pub fn steps(&self) -> impl Iterator<Item = usize> + '_ {
        let dense = (!self.is_sparse()).then_some(0..=self.generation_steps);
        let recorded = self.is_sparse().then(|| self.step_index.keys().copied());
        dense.into_iter().flatten().chain(recorded.into_iter().flatten())
    }

    /// Representative events for `step`
    #[must_use]
    pub fn step_summary(&self, step: usize) -> StepSummary<'_> {
        let slots = self.step_index.get(&step).copied().unwrap_or_default();
        let filtering = slots.filtering.and_then(|i| match &self.events[i] {
            TraceEvent::Filtering(f) => Some(f),
            TraceEvent::Accepted(_) => None,
        });
        let accepted = slots.accepted.and_then(|i| match &self.events[i] {
            TraceEvent::Accepted(a) => Some(a),
            TraceEvent::Filtering(_) => None,
        });
        StepSummary {
            step,
            filtering,
            accepted,
        }
    }
}
