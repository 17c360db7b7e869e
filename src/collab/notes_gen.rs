//! collab::notes_gen
//!
//! Deterministic, template-based release notes generation.
//!
//! # Design
//!
//! The template generator produces markdown from the run's commit window
//! with audience and tone presets. Being deterministic, its inputs hash
//! makes caching exact: identical inputs always produce identical notes,
//! so the orchestrator can skip regeneration when the hash matches.
//!
//! LLM-backed generators implement the same [`NotesGenerator`] trait;
//! they plug in without touching the orchestrators.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::traits::{NotesError, NotesGenerator, NotesOptions, NotesOutput};
use crate::core::run::ReleaseRun;
use crate::core::types::UtcTimestamp;

/// Bumped whenever the template output changes, so cached notes from an
/// older template are regenerated.
const TEMPLATE_REV: &str = "template-1";

/// Deterministic markdown notes generator.
#[derive(Debug, Clone, Default)]
pub struct TemplateNotesGenerator;

impl TemplateNotesGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self
    }

    fn heading(version: &str, audience: &str) -> String {
        match audience {
            "developers" => format!("# Release {version}"),
            "operators" => format!("# Deployment notes for {version}"),
            _ => format!("# What's new in {version}"),
        }
    }
}

#[async_trait]
impl NotesGenerator for TemplateNotesGenerator {
    async fn generate(
        &self,
        run: &ReleaseRun,
        options: &NotesOptions,
    ) -> Result<NotesOutput, NotesError> {
        let version = run
            .version_next
            .as_ref()
            .ok_or_else(|| NotesError::MissingInput("version_next is not set".into()))?
            .to_string();

        let mut text = Self::heading(&version, &options.audience);
        text.push_str("\n\n");

        let count = run.commits.len();
        let window = if run.base_ref.is_empty() {
            "the beginning of history".to_string()
        } else {
            format!("`{}`", run.base_ref)
        };
        text.push_str(&format!(
            "This release includes {count} change{} since {window}.\n",
            if count == 1 { "" } else { "s" }
        ));

        if options.tone == "detailed" && !run.commits.is_empty() {
            text.push_str("\n## Changes\n\n");
            for commit in &run.commits {
                text.push_str(&format!("- `{}`\n", commit.short(12)));
            }
        }

        Ok(NotesOutput {
            text,
            provider: "template".into(),
            model: String::new(),
            generated_at: UtcTimestamp::now(),
        })
    }

    fn compute_inputs_hash(&self, run: &ReleaseRun, options: &NotesOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(TEMPLATE_REV.as_bytes());
        hasher.update(b"\0");
        hasher.update(run.head_sha.as_str().as_bytes());
        hasher.update(b"\0");
        for commit in &run.commits {
            hasher.update(commit.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\0");
        if let Some(version) = &run.version_next {
            hasher.update(version.to_string().as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(options.audience.as_bytes());
        hasher.update(b"\0");
        hasher.update(options.tone.as_bytes());
        hex::encode(hasher.finalize())
    }
}
