//! CLI command implementations
//!
//! Command definitions and their handlers live in [`handlers`], kept out
//! of `main.rs` so they can be exercised from tests.

// CLI glue code - relaxed lint requirements
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

use tracing::error;

use crate::config::ConfigOverrides;
use crate::error::Result;

pub mod handlers;
pub use handlers::{Cli, Commands, ParseOptions};

/// Main CLI entrypoint - dispatches commands to handlers
pub async fn entrypoint(cli: Cli) -> Result<()> {
    let result = match cli.command {
        Commands::Parse {
            trace,
            output,
            structured,
            top_k,
            summary,
            validate,
            threshold,
        } => handlers::handle_parse(
            &trace,
            &ParseOptions {
                output,
                structured,
                top_k,
                summary,
                validate,
                threshold,
            },
        ),
        Commands::Merge {
            api_response,
            rejection_log,
            output,
        } => handlers::handle_merge(&api_response, &rejection_log, &output),
        Commands::Proxy {
            config,
            host,
            port,
            upstream_url,
            output_dir,
            rejection_log,
            no_save,
            monitor_timeout_secs,
        } => {
            let overrides = ConfigOverrides {
                host,
                port,
                upstream_url,
                output_dir,
                rejection_log,
                no_save,
                monitor_timeout_secs,
            };
            handlers::handle_proxy(config.as_deref(), overrides).await
        },
    };

    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

/// Process exit status for a command result
///
/// 1 when the command's input is unusable, 2 for runtime failures such as
/// a bad config or an unreachable upstream.
#[must_use]
pub fn exit_status(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_fatal_for_batch() => 1,
        Err(_) => 2,
    }
}
