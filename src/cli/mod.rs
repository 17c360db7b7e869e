//! cli
//!
//! Command-line interface layer for capstan.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Build the engine dependency graph for the target repository
//! - Delegate to the orchestrators and render their outputs
//! - Does NOT mutate run state directly
//!
//! # Architecture
//!
//! The CLI layer is thin. It parses arguments via clap and dispatches
//! into [`crate::engine`]; all state changes flow through the engine's
//! validated orchestrators. Exit code 0 means success or
//! idempotent-already-done; any surfaced error exits non-zero.

pub mod args;
pub mod commands;

pub use args::{Cli, Command};

use anyhow::Result;

use crate::core::types::Actor;
use crate::engine::Deps;
use crate::ui::output::Verbosity;

/// Run the CLI application.
///
/// This is the main entry point called from `main.rs`.
pub async fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let repo_root = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    let actor = Actor::human(
        cli.actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string()),
    );

    let ctx = commands::Context {
        deps: Deps::production(repo_root)?,
        actor,
        json: cli.json,
        verbosity: Verbosity::from_flags(cli.quiet, cli.debug),
    };

    commands::dispatch(cli.command, &ctx).await
}
