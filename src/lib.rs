//! # Gramtrace
//!
//! Analysis tooling for grammar-constrained LLM generation.
//!
//! A grammar engine restricts which tokens a model may emit at each step.
//! Gramtrace reads what happened at those steps and answers two questions:
//! how much probability mass did the grammar take away, and which tokens
//! were rejected during sampling.
//!
//! ## Pipelines
//!
//! - **Trace analysis**: [`ingest`] parses a grammar trace into a
//!   [`model::GenerationTrace`], [`stats`] finds high-impact decision
//!   points, and [`export`] writes dashboard and structured JSON views.
//! - **Offline merge**: [`correlate`] joins an OpenAI-compatible chat
//!   completion (with `logprobs`) and a rejection-sampling log by step.
//! - **Online proxy**: [`proxy`] relays traffic to an inference server,
//!   and [`monitor`] tails the rejection log so every chat completion gets
//!   a combined document on disk.
//!
//! ## Example
//!
//! ```rust
//! use gramtrace::ingest::TraceIngestor;
//! use gramtrace::stats::{decision_points, DEFAULT_DECISION_THRESHOLD};
//!
//! let raw = r#"{"trace_version": "1.0", "events": [
//!     {"type": "token_filtering", "step": 0, "data": {
//!         "candidates_before": [{"token": 1, "logit": 0.0}, {"token": 2, "logit": 0.0}],
//!         "candidates_after": [{"token": 1, "logit": 0.0}],
//!         "rejected_count": 1}},
//!     {"type": "token_accepted", "step": 0, "data": {"token": 1, "token_str": "{"}}
//! ]}"#;
//!
//! let ingested = TraceIngestor::new().parse_str(raw).unwrap();
//! let points = decision_points(&ingested.trace, DEFAULT_DECISION_THRESHOLD);
//! assert_eq!(points.len(), 1);
//! assert_eq!(points[0].step, 0);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f64 for averages is acceptable
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests

/// CLI command implementations (extracted for testability)
pub mod cli;
/// Proxy configuration (TOML file plus command-line overrides)
pub mod config;
/// Step-wise correlation of token telemetry with rejection logs
pub mod correlate;
pub mod error;
pub mod export;
/// Grammar trace ingestion and validation
pub mod ingest;
mod lenient;
pub mod model;
/// Tail monitoring of a rejection log that is rewritten in place
pub mod monitor;
pub mod probability;
pub mod proxy;
pub mod sentinel;
pub mod stats;

// Re-exports for convenience
pub use error::{Result, TracerError};
pub use model::GenerationTrace;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
