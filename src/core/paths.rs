//! core::paths
//!
//! Centralized path routing for capstan storage locations.
//!
//! # Architecture
//!
//! All capstan storage lives under `<repo_root>/.capstan/` and every path
//! must be computed through [`StorePaths`].
//!
//! **Hard rule:** no code outside this module may join `.capstan` path
//! segments by hand. Centralizing the layout keeps the store, lock
//! manager, and journal agreeing on where files live.
//!
//! # Storage Layout
//!
//! ```text
//! <repo_root>/.capstan/
//!   config.toml                  repository configuration
//!   audit.log                    plugin audit log (JSON lines)
//!   releases/
//!     <run_id>.json              canonical run snapshot
//!     <run_id>.state.json        minimal state projection
//!     <run_id>.machine.json      state-machine export (plan time)
//!     latest                     text: run id of the current run
//!     lock                       advisory lock (JSON holder metadata)
//!   events/
//!     <run_id>.events.jsonl      append-only event journal
//!   plugins/                     repo-local plugin binaries
//! ```
//!
//! # Example
//!
//! ```
//! use capstan::core::paths::StorePaths;
//! use std::path::PathBuf;
//!
//! let paths = StorePaths::new(PathBuf::from("/repo"));
//! assert_eq!(
//!     paths.lock_path(),
//!     PathBuf::from("/repo/.capstan/releases/lock")
//! );
//! ```

use std::path::{Path, PathBuf};

use crate::core::types::RunId;

/// Directory name for all capstan storage under a repository root.
pub const DOT_DIR: &str = ".capstan";

/// Centralized path routing for capstan storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Filesystem root of the repository (the working tree, not `.git`).
    repo_root: PathBuf,
}

impl StorePaths {
    /// Create path routing for a repository root.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// The repository root this routing is anchored at.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// The root capstan directory: `<repo_root>/.capstan`.
    pub fn dot_dir(&self) -> PathBuf {
        self.repo_root.join(DOT_DIR)
    }

    /// The repository configuration file.
    pub fn repo_config_path(&self) -> PathBuf {
        self.dot_dir().join("config.toml")
    }

    /// The plugin audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.dot_dir().join("audit.log")
    }

    /// The releases directory.
    pub fn releases_dir(&self) -> PathBuf {
        self.dot_dir().join("releases")
    }

    /// The events directory.
    pub fn events_dir(&self) -> PathBuf {
        self.dot_dir().join("events")
    }

    /// The repo-local plugin directory.
    pub fn plugins_dir(&self) -> PathBuf {
        self.dot_dir().join("plugins")
    }

    /// A run's canonical snapshot.
    pub fn run_snapshot_path(&self, run_id: &RunId) -> PathBuf {
        self.releases_dir().join(format!("{run_id}.json"))
    }

    /// A run's minimal state projection.
    pub fn run_state_path(&self, run_id: &RunId) -> PathBuf {
        self.releases_dir().join(format!("{run_id}.state.json"))
    }

    /// A run's state-machine export.
    pub fn run_machine_path(&self, run_id: &RunId) -> PathBuf {
        self.releases_dir().join(format!("{run_id}.machine.json"))
    }

    /// The latest-run pointer file.
    pub fn latest_path(&self) -> PathBuf {
        self.releases_dir().join("latest")
    }

    /// The advisory lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.releases_dir().join("lock")
    }

    /// A run's append-only event log.
    pub fn event_log_path(&self, run_id: &RunId) -> PathBuf {
        self.events_dir().join(format!("{run_id}.events.jsonl"))
    }

    /// Ensure the storage directory structure exists.
    ///
    /// Creates `releases/` and `events/` if needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if directory creation fails.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.releases_dir())?;
        std::fs::create_dir_all(self.events_dir())?;
        Ok(())
    }
}
