//! Gramtrace CLI - grammar-constrained generation analysis
//!
//! # Commands
//!
//! - `parse` - Summarize, validate and export a grammar trace
//! - `merge` - Join an API response with a rejection log
//! - `proxy` - Relay an inference server and correlate chat completions

use std::process::ExitCode;

use clap::Parser;
use gramtrace::cli::{entrypoint, exit_status, Cli};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("gramtrace v{}", gramtrace::VERSION);

    let result = entrypoint(cli).await;
    ExitCode::from(exit_status(&result))
}
