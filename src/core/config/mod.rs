//! core::config
//!
//! Repository configuration loading and fingerprinting.
//!
//! # Overview
//!
//! Capstan is configured per repository at `.capstan/config.toml`. A
//! missing file yields the default configuration; a malformed or invalid
//! file is an error (silently ignoring a bad config could change release
//! policy).
//!
//! # Fingerprints
//!
//! Planning captures two integrity hashes:
//! - [`config_hash`] over the whole canonical config
//! - [`plugin_plan_hash`] over the ordered plugin list
//!
//! Both feed the run's plan hash, so a config or plugin change after
//! planning surfaces as a plan-hash mismatch and invalidates approvals.
//!
//! # Example
//!
//! ```no_run
//! use capstan::core::config::RepoConfig;
//! use capstan::core::paths::StorePaths;
//!
//! let paths = StorePaths::new("/path/to/repo");
//! let config = RepoConfig::load(&paths).unwrap();
//! println!("tag prefix: {}", config.tag_prefix());
//! ```

pub mod schema;

pub use schema::{
    ApprovalConfig, ApprovalLevelConfig, NotesConfig, PluginCapabilities, PluginConfig,
    PluginHostConfig, PluginLimits, RepoConfig, StepConfig, ThresholdsConfig,
};

use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::paths::StorePaths;

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

impl RepoConfig {
    /// Load the repository configuration, or defaults when absent.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ReadError`] for I/O failures other than "missing"
    /// - [`ConfigError::ParseError`] for malformed TOML
    /// - [`ConfigError::InvalidValue`] when validation fails
    pub fn load(paths: &StorePaths) -> Result<Self, ConfigError> {
        let path = paths.repo_config_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::ReadError { path, source }),
        };

        let config: RepoConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Deterministic fingerprint of the whole configuration.
    ///
    /// Computed over the canonical re-serialized form, so formatting and
    /// comment differences in the file do not change the hash.
    pub fn config_hash(&self) -> String {
        let canonical = toml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deterministic fingerprint of the ordered plugin list.
    ///
    /// Covers each plugin's name and full configuration, in registration
    /// order, so adding, removing, reordering, or reconfiguring a plugin
    /// changes the hash.
    pub fn plugin_plan_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for plugin in &self.plugins {
            hasher.update(plugin.name.as_bytes());
            hasher.update(b"\0");
            let canonical = toml::to_string(plugin).unwrap_or_default();
            hasher.update(canonical.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
