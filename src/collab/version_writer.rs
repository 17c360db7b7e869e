//! collab::version_writer
//!
//! Writes the decided version into the working tree.
//!
//! # Design
//!
//! The default writer maintains two files at the repository root:
//!
//! - `VERSION` - the bare version string
//! - `CHANGELOG.md` - a dated section per release, newest first
//!
//! Manifest-specific writers (Cargo.toml, package.json) implement the
//! same [`VersionWriter`] trait.

use std::path::PathBuf;

use async_trait::async_trait;

use super::traits::{VersionWriter, WriterError};
use crate::core::version::Version;

/// Writes `VERSION` and `CHANGELOG.md` at the repository root.
#[derive(Debug, Clone)]
pub struct FileVersionWriter {
    repo_root: PathBuf,
}

impl FileVersionWriter {
    /// Create a writer for a repository root.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl VersionWriter for FileVersionWriter {
    async fn write_version(&self, version: &Version) -> Result<(), WriterError> {
        let path = self.repo_root.join("VERSION");
        tokio::fs::write(&path, format!("{version}\n")).await?;
        Ok(())
    }

    async fn write_changelog(&self, version: &Version, text: &str) -> Result<(), WriterError> {
        let path = self.repo_root.join("CHANGELOG.md");
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(WriterError::Io(e)),
        };

        let date = chrono::Utc::now().format("%Y-%m-%d");
        let section = format!("## {version} - {date}\n\n{}\n", text.trim_end());

        // Keep a top-level "# Changelog" heading in place; new sections go
        // directly under it.
        let content = match existing.strip_prefix("# Changelog\n") {
            Some(rest) => format!("# Changelog\n\n{section}{rest}", rest = rest.trim_start_matches('\n')),
            None if existing.is_empty() => format!("# Changelog\n\n{section}"),
            None => format!("{section}\n{existing}"),
        };

        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}
