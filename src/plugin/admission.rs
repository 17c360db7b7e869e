//! plugin::admission
//!
//! Binary admission control for plugins.
//!
//! # Architecture
//!
//! A plugin binary is only executed when it passes four checks:
//!
//! 1. Its name matches `[A-Za-z0-9_-]{1,64}`
//! 2. Its path resolves (symlinks included) to an absolute real path
//! 3. The resolved path lies inside one of the allowed plugin
//!    directories
//! 4. It is a regular file with an execute bit set
//!
//! Allowed directories: `$HOME/.capstan/plugins`,
//! `<repo_root>/.capstan/plugins`, `/usr/local/lib/capstan/plugins`,
//! `/usr/lib/capstan/plugins`.
//!
//! Every rejection is surfaced as a typed [`AdmissionError`]; the host
//! writes an audit entry for each one.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::paths::StorePaths;

/// System-wide plugin directories.
const SYSTEM_PLUGIN_DIRS: [&str; 2] = ["/usr/local/lib/capstan/plugins", "/usr/lib/capstan/plugins"];

/// Errors from plugin admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The plugin name violates the name rule.
    #[error("invalid plugin name '{0}': must match [A-Za-z0-9_-]{{1,64}}")]
    InvalidName(String),

    /// No binary was found for the plugin.
    #[error("plugin binary not found: {0}")]
    NotFound(String),

    /// The path could not be resolved.
    #[error("cannot resolve plugin path '{path}': {message}")]
    Unresolvable { path: PathBuf, message: String },

    /// The resolved path is outside every allowed directory.
    #[error("plugin binary '{0}' is outside the allowed plugin directories")]
    OutsideAllowedDirs(PathBuf),

    /// The resolved path is not a regular file.
    #[error("plugin path '{0}' is not a regular file")]
    NotAFile(PathBuf),

    /// The file has no execute bit.
    #[error("plugin binary '{0}' is not executable")]
    NotExecutable(PathBuf),
}

/// Validate a plugin name against `[A-Za-z0-9_-]{1,64}`.
///
/// Called at config-parse time so a bad name never reaches the
/// filesystem.
pub fn validate_plugin_name(name: &str) -> Result<(), AdmissionError> {
    if name.is_empty() || name.len() > 64 {
        return Err(AdmissionError::InvalidName(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AdmissionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// The directories plugin binaries may live in, in search order.
pub fn allowed_plugin_dirs(repo_root: &Path) -> Vec<PathBuf> {
    let mut allowed = Vec::new();
    if let Some(home) = dirs::home_dir() {
        allowed.push(home.join(".capstan").join("plugins"));
    }
    allowed.push(StorePaths::new(repo_root).plugins_dir());
    for dir in SYSTEM_PLUGIN_DIRS {
        allowed.push(PathBuf::from(dir));
    }
    allowed
}

/// Find a binary named after the plugin in the allowed directories.
pub fn discover_binary(name: &str, repo_root: &Path) -> Option<PathBuf> {
    allowed_plugin_dirs(repo_root)
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Admit a plugin binary for execution.
///
/// Returns the fully resolved path on success.
///
/// # Errors
///
/// Any failed check aborts admission with the corresponding
/// [`AdmissionError`]; the caller audits the rejection.
pub fn admit_binary(name: &str, path: &Path, repo_root: &Path) -> Result<PathBuf, AdmissionError> {
    validate_plugin_name(name)?;

    // Resolve to an absolute path with all symlinks followed, so the
    // containment check sees the real location.
    let resolved = path
        .canonicalize()
        .map_err(|e| AdmissionError::Unresolvable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let contained = allowed_plugin_dirs(repo_root).iter().any(|dir| {
        let Ok(dir) = dir.canonicalize() else {
            return false;
        };
        match resolved.strip_prefix(&dir) {
            Ok(rel) => {
                // Containment means a non-empty relative remainder with no
                // parent traversal.
                !rel.as_os_str().is_empty()
                    && rel
                        .components()
                        .all(|c| matches!(c, std::path::Component::Normal(_)))
            }
            Err(_) => false,
        }
    });
    if !contained {
        return Err(AdmissionError::OutsideAllowedDirs(resolved));
    }

    let metadata = std::fs::metadata(&resolved).map_err(|e| AdmissionError::Unresolvable {
        path: resolved.clone(),
        message: e.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(AdmissionError::NotAFile(resolved));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(AdmissionError::NotExecutable(resolved));
        }
    }

    Ok(resolved)
}
