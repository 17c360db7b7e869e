//! Capstan binary entry point.
//!
//! Initializes tracing (controlled by `CAPSTAN_LOG`, e.g.
//! `CAPSTAN_LOG=capstan=debug`), runs the CLI, and maps surfaced errors
//! to a non-zero exit code.

use capstan::ui::output;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CAPSTAN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = capstan::cli::run().await {
        output::error(format!("{e:#}"));
        std::process::exit(1);
    }
}
