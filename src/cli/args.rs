//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! Available on all commands:
//! - `--repo <path>`: Operate on that repository (defaults to cwd)
//! - `--actor <id>`: Actor identity (defaults to `$USER`)
//! - `--json`: Machine-readable output
//! - `--debug`: Enable debug logging
//! - `--quiet` / `-q`: Minimal output

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Capstan - release governance for Git repositories
#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Operate on this repository root (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Actor identity recorded on mutations (defaults to $USER)
    #[arg(long, global = true)]
    pub actor: Option<String>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Minimal output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan a new release run from the current working tree
    Plan {
        /// Base ref for the commit window (defaults to the latest version tag)
        #[arg(long)]
        base: Option<String>,

        /// Tag-push mode: release exactly this tag
        #[arg(long, requires = "set_version")]
        tag: Option<String>,

        /// Tag-push mode: release exactly this version
        #[arg(long = "version", value_name = "VERSION", requires = "tag")]
        set_version: Option<String>,

        /// Plan even if an active run exists or HEAD drifted
        #[arg(long)]
        force: bool,
    },

    /// Apply the version decision and write manifests
    Bump {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Override the proposed version
        #[arg(long = "version", value_name = "VERSION")]
        set_version: Option<String>,

        /// Override the tag name
        #[arg(long)]
        tag: Option<String>,

        /// Bypass the HEAD drift check
        #[arg(long)]
        force: bool,
    },

    /// Generate (or regenerate) release notes
    Notes {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Audience preset: users, developers, operators
        #[arg(long)]
        audience: Option<String>,

        /// Tone preset: concise, detailed
        #[arg(long)]
        tone: Option<String>,

        /// Bypass the HEAD drift check
        #[arg(long)]
        force: bool,
    },

    /// Approve the run for publishing
    Approve {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Auto-approve (policy decides; rejected above the risk threshold)
        #[arg(long)]
        auto: bool,

        /// Record a grant at this approval level
        #[arg(long)]
        level: Option<u32>,

        /// Justification recorded with the grant
        #[arg(long)]
        justification: Option<String>,

        /// Bypass the HEAD drift check
        #[arg(long)]
        force: bool,
    },

    /// Execute the publishing steps
    Publish {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Mark every step skipped without touching external systems
        #[arg(long)]
        dry_run: bool,

        /// Bypass the HEAD drift check
        #[arg(long)]
        force: bool,
    },

    /// Retry a failed publish
    Retry {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Mark remaining steps skipped instead of executing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the current run's status
    Status {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,
    },

    /// Cancel the current run
    Cancel {
        /// Run id (defaults to the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Why the run is being abandoned
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Print the release state machine as JSON
    Machine,
}
