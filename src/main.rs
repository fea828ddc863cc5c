//! iquery-sweep CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parsed first so --log-level is known before logging starts
    let cli = iquery_sweep::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    iquery_sweep::cli::run_with_cli(cli).await
}
