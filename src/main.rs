//! Waza - benchmark execution engine for AI agent skills
//!
//! Main entry point for the CLI.

use clap::Parser;

#[tokio::main]
async fn main() {
    init_logging();

    let cli = waza::cli::Cli::parse();
    tracing::info!("starting waza {}", waza::VERSION);

    match waza::cli::execute(cli).await {
        Ok(code) => {
            tracing::info!(exit_code = code, "waza finished");
            std::process::exit(code);
        }
        Err(e) => {
            tracing::error!("fatal: {e}");
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

/// Initialize logging to stderr, leaving stdout for command output.
fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waza=info")),
        )
        .init();
}
