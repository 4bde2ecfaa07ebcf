//! Command-line definitions and command handlers

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{ConfigOverrides, ProxyConfig};
use crate::correlate::{merge_files, CombinedDocument, DEFAULT_MERGE_OUTPUT};
use crate::error::Result;
use crate::export::{export_for_dashboard, export_structured, DEFAULT_TOP_K};
use crate::ingest::{SchemaWarning, TraceIngestor};
use crate::model::GenerationTrace;
use crate::stats::{decision_points, DEFAULT_DECISION_THRESHOLD};

/// Characters of generated text shown in the summary
pub const SUMMARY_TEXT_LIMIT: usize = 500;

/// Decision points listed in the summary
pub const SUMMARY_DECISION_LIMIT: usize = 10;

/// Gramtrace - grammar-constrained generation analysis
///
/// Parses grammar traces, merges token telemetry with rejection-sampling
/// logs, and proxies an inference server while correlating both streams.
#[derive(Parser, Debug)]
#[command(name = "gramtrace")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a grammar trace, print a summary and export it
    ///
    /// Examples:
    ///   gramtrace parse traces/trace.json --summary --validate
    ///   gramtrace parse traces/trace.json -o dashboard.json -j structured.json -k 10
    Parse {
        /// Trace file written by the grammar engine
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Write the dashboard export here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the structured export here
        #[arg(short = 'j', long)]
        structured: Option<PathBuf>,

        /// Alternatives per step in the structured export
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        /// Print summary statistics
        #[arg(short, long)]
        summary: bool,

        /// Validate trace integrity
        #[arg(short, long)]
        validate: bool,

        /// Probability shift above which a step is a decision point
        #[arg(long, default_value_t = DEFAULT_DECISION_THRESHOLD)]
        threshold: f64,
    },
    /// Merge an API response with a rejection log
    ///
    /// Example:
    ///   gramtrace merge debug_response.json traces/rejection_log.json traces/combined.json
    Merge {
        /// Chat completion response with logprobs
        #[arg(value_name = "API_RESPONSE")]
        api_response: PathBuf,

        /// Rejection log written by the decoding engine
        #[arg(value_name = "REJECTION_LOG")]
        rejection_log: PathBuf,

        /// Combined output file
        #[arg(value_name = "OUTPUT", default_value = DEFAULT_MERGE_OUTPUT)]
        output: PathBuf,
    },
    /// Proxy an inference server and correlate chat completions with rejections
    Proxy {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// Upstream inference server URL
        #[arg(long)]
        upstream_url: Option<String>,

        /// Directory for combined documents
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Rejection log to monitor
        #[arg(long)]
        rejection_log: Option<PathBuf>,

        /// Relay only; do not correlate or save combined documents
        #[arg(long)]
        no_save: bool,

        /// Seconds to wait for rejection entries per request
        #[arg(long)]
        monitor_timeout_secs: Option<u64>,
    },
}

// =============================================================================
// PARSE
// =============================================================================

/// Options of the `parse` command
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Dashboard export path
    pub output: Option<PathBuf>,
    /// Structured export path
    pub structured: Option<PathBuf>,
    /// Alternatives per structured record
    pub top_k: usize,
    /// Force the summary
    pub summary: bool,
    /// Run the validation pass
    pub validate: bool,
    /// Decision-point threshold
    pub threshold: f64,
}

/// Validation report as printed by `parse --validate`
#[must_use]
pub fn format_validation(warnings: &[SchemaWarning]) -> String {
    if warnings.is_empty() {
        return "\n=== Validation Passed ===".to_string();
    }
    let mut out = format!("\n=== Validation Warnings ({}) ===", warnings.len());
    for warning in warnings {
        let _ = write!(out, "\n  - {warning}");
    }
    out
}

/// Trace summary as printed by `parse`
#[must_use]
pub fn format_summary(trace: &GenerationTrace, threshold: f64) -> String {
    let mut out = String::from("\n=== Trace Summary ===");
    let _ = write!(out, "\nVersion: {}", trace.version());
    let _ = write!(out, "\nGeneration steps: {}", trace.generation_steps());
    let _ = write!(out, "\nTokens generated: {}", trace.generated_tokens().len());
    let _ = write!(out, "\nTotal rejections: {}", trace.total_rejections());

    if !trace.generated_tokens().is_empty() {
        let text = trace.generated_text();
        let chars = text.chars().count();
        let preview: String = text.chars().take(SUMMARY_TEXT_LIMIT).collect();
        let ellipsis = if chars > SUMMARY_TEXT_LIMIT { "..." } else { "" };
        let _ = write!(out, "\n\nGenerated text ({chars} chars):\n{preview}{ellipsis}");
    }

    let points = decision_points(trace, threshold);
    if !points.is_empty() {
        let _ = write!(out, "\n\nHigh-impact decision points ({}):", points.len());
        for point in points.iter().take(SUMMARY_DECISION_LIMIT) {
            let token = trace.step_summary(point.step).token().unwrap_or("(unknown)");
            let _ = write!(
                out,
                "\n  Step {}: {token} (prob shift: {:.1}%)",
                point.step,
                point.prob_shift * 100.0
            );
        }
    }
    out
}

/// Parse a trace file and run the requested reports and exports
pub fn handle_parse(trace_path: &Path, options: &ParseOptions) -> Result<()> {
    let ingestor = TraceIngestor::new();
    let ingested = ingestor.parse_file(trace_path)?;
    let trace = &ingested.trace;
    info!(
        path = %trace_path.display(),
        events = trace.events().len(),
        warnings = ingested.warnings.len(),
        "trace parsed"
    );

    if options.validate {
        println!("{}", format_validation(&ingestor.validate(trace)));
    }

    if options.summary || options.output.is_none() {
        println!("{}", format_summary(trace, options.threshold));
    }

    if let Some(output) = &options.output {
        export_for_dashboard(trace, output, options.threshold)?;
        println!("\nExported to: {}", output.display());
    }

    if let Some(structured) = &options.structured {
        export_structured(trace, structured, options.top_k)?;
        println!("\nStructured JSON exported to: {}", structured.display());
    }

    Ok(())
}

// =============================================================================
// MERGE
// =============================================================================

/// Merge report as printed by `merge`
#[must_use]
pub fn format_merge_report(combined: &CombinedDocument) -> String {
    format!(
        "Merged {} steps\n  - Rejected steps: {}\n  - Rejection rate: {:.1}%",
        combined.summary.total_steps,
        combined.summary.rejected_steps,
        combined.summary.rejection_rate * 100.0
    )
}

/// Merge an API response with a rejection log and save the result
pub fn handle_merge(api_response: &Path, rejection_log: &Path, output: &Path) -> Result<()> {
    info!(
        api_response = %api_response.display(),
        rejection_log = %rejection_log.display(),
        "merging logs"
    );
    let combined = merge_files(api_response, rejection_log, output)?;
    println!("{}", format_merge_report(&combined));
    println!("Saved combined output to: {}", output.display());
    Ok(())
}

// =============================================================================
// PROXY
// =============================================================================

/// Resolve the proxy configuration from an optional file and CLI overrides
pub fn resolve_proxy_config(file: Option<&Path>, overrides: ConfigOverrides) -> Result<ProxyConfig> {
    let mut config = match file {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    config.apply_overrides(overrides);
    config.validate()?;
    if !config.save_combined {
        warn!("combined documents disabled; relaying only");
    }
    Ok(config)
}

/// Run the forwarding proxy until the process is stopped
pub async fn handle_proxy(file: Option<&Path>, overrides: ConfigOverrides) -> Result<()> {
    let config = resolve_proxy_config(file, overrides)?;
    crate::proxy::serve(config).await
}
