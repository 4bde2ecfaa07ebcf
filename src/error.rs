//! Error types for gramtrace
//!
//! One taxonomy for every failure the analysis pipeline can surface.
//! Schema problems are not errors: they are [`crate::ingest::SchemaWarning`]
//! values, and degenerate arithmetic (empty candidate sets, zero steps)
//! resolves to neutral values instead of failing.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`TracerError`]
pub type Result<T> = std::result::Result<T, TracerError>;

/// Errors produced while ingesting, correlating, exporting or proxying
#[derive(Debug, Error)]
pub enum TracerError {
    /// Input file or document is absent
    #[error("Input not found: {}", path.display())]
    MissingInput {
        /// Path that was looked up
        path: PathBuf,
    },

    /// Document could not be parsed, or lacks a required section
    #[error("Malformed document: {reason}")]
    MalformedDocument {
        /// Parser or structure diagnostic
        reason: String,
    },

    /// Filesystem operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Operation and underlying error
        message: String,
    },

    /// Forwarding call to the upstream inference server failed
    #[error("Upstream request failed: {0}")]
    UpstreamFailure(String),

    /// Forwarding call to the upstream inference server timed out
    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),

    /// Merge, export or persist step of the online path failed
    #[error("Correlation failed: {0}")]
    CorrelationFailure(String),

    /// Configuration value is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TracerError {
    /// Build an [`TracerError::Io`] from an operation description and source error
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{context}: {err}"),
        }
    }

    /// Build a [`TracerError::MalformedDocument`] from a JSON error
    pub fn malformed(context: impl std::fmt::Display, err: serde_json::Error) -> Self {
        Self::MalformedDocument {
            reason: format!("{context}: {err}"),
        }
    }

    /// Whether a batch command must stop on this error
    #[must_use]
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            Self::MissingInput { .. } | Self::MalformedDocument { .. } | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_input_display() {
        let err = TracerError::MissingInput {
            path: PathBuf::from("traces/trace.json"),
        };
        assert_eq!(err.to_string(), "Input not found: traces/trace.json");
        assert!(err.is_fatal_for_batch());
    }

    #[test]
    fn test_malformed_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = TracerError::malformed("trace.json", json_err);
        assert!(err.to_string().starts_with("Malformed document: trace.json:"));
    }

    #[test]
    fn test_correlation_failure_not_fatal_for_batch() {
        let err = TracerError::CorrelationFailure("disk full".to_string());
        assert!(!err.is_fatal_for_batch());
        assert_eq!(err.to_string(), "Correlation failed: disk full");
    }
}
