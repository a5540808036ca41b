//! Multi-environment constraint profiling tool.
//!
//! Connects to every environment in a run file, profiles the tables the
//! logical model names and writes a consensus report saying which NOT NULL,
//! UNIQUE and FOREIGN KEY constraints can be applied everywhere.
//!
//! # Guarantees
//! - Read-only database operations only
//! - No credentials stored or logged
//! - Ctrl-C cancels every environment and exits cleanly

use clap::Parser;
use driftprobe_collect::{Cli, execute};
use driftprobe_core::logging::init_logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_json) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
