//! collab::traits
//!
//! Collaborator contracts consumed by the use-case orchestrators.
//!
//! # Design
//!
//! The core drives four narrow seams: repository inspection, version
//! writing, notes generation, and step publishing. Each is an async
//! trait because the real implementations do I/O (git, filesystem,
//! network, child processes). Orchestrators depend only on these traits;
//! concrete adapters live beside them and in tests' mocks.
//!
//! # Example
//!
//! ```ignore
//! use capstan::collab::{NotesGenerator, NotesOptions};
//!
//! async fn regenerate(generator: &dyn NotesGenerator, run: &ReleaseRun) {
//!     let options = NotesOptions::default();
//!     let output = generator.generate(run, &options).await.unwrap();
//!     println!("notes by {}: {} chars", output.provider, output.text.len());
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

use crate::core::run::{ReleaseRun, StepPlan};
use crate::core::types::{CommitSha, UtcTimestamp};
use crate::core::version::Version;

/// Errors from repository inspection.
#[derive(Debug, Error)]
pub enum InspectorError {
    /// Not inside a Git repository.
    #[error("not a git repository: {0}")]
    NotARepo(String),

    /// A ref could not be resolved.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// The commit window is malformed (e.g. base not an ancestor).
    #[error("cannot resolve commits {base}..{head}: {message}")]
    BadRange {
        base: String,
        head: String,
        message: String,
    },

    /// Underlying git failure.
    #[error("git error: {0}")]
    Git(String),

    /// Forge lookup failure (network, auth).
    #[error("forge error: {0}")]
    Forge(String),
}

/// Read-only repository inspection.
#[async_trait]
pub trait RepoInspector: Send + Sync {
    /// The working tree's current HEAD commit.
    async fn head_sha(&self) -> Result<CommitSha, InspectorError>;

    /// Whether the working tree has no uncommitted changes.
    async fn is_clean(&self) -> Result<bool, InspectorError>;

    /// The commits in `base_ref..head`, oldest first.
    async fn resolve_commits(
        &self,
        base_ref: &str,
        head: &CommitSha,
    ) -> Result<Vec<CommitSha>, InspectorError>;

    /// The `origin` remote URL, if configured.
    async fn remote_url(&self) -> Result<Option<String>, InspectorError>;

    /// The currently checked-out branch name.
    async fn current_branch(&self) -> Result<String, InspectorError>;

    /// The highest semver tag with the given prefix, with its version.
    async fn latest_version_tag(
        &self,
        prefix: &str,
    ) -> Result<Option<(String, Version)>, InspectorError>;

    /// Whether a tag with this name exists.
    async fn tag_exists(&self, name: &str) -> Result<bool, InspectorError>;

    /// Whether a forge release with this name exists. Best-effort: absent
    /// forge or credentials reports `false`.
    async fn release_exists(&self, name: &str) -> Result<bool, InspectorError>;
}

/// Errors from writing versions into the working tree.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Filesystem failure.
    #[error("version write error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mutates repository manifests to carry the new version.
#[async_trait]
pub trait VersionWriter: Send + Sync {
    /// Write the version into the repository's manifest(s).
    async fn write_version(&self, version: &Version) -> Result<(), WriterError>;

    /// Prepend a changelog section for the version.
    async fn write_changelog(&self, version: &Version, text: &str) -> Result<(), WriterError>;
}

/// Errors from notes generation.
#[derive(Debug, Error)]
pub enum NotesError {
    /// The run lacks inputs the generator needs.
    #[error("cannot generate notes: {0}")]
    MissingInput(String),

    /// Provider failure (network, model).
    #[error("notes provider error: {0}")]
    Provider(String),
}

/// Options controlling notes generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotesOptions {
    /// Audience preset: `users`, `developers`, or `operators`.
    pub audience: String,
    /// Tone preset: `concise` or `detailed`.
    pub tone: String,
}

impl Default for NotesOptions {
    fn default() -> Self {
        Self {
            audience: "users".into(),
            tone: "concise".into(),
        }
    }
}

/// Output of one notes generation.
#[derive(Debug, Clone, PartialEq)]
pub struct NotesOutput {
    /// The generated text (markdown).
    pub text: String,
    /// Provider identifier (e.g. `template`).
    pub provider: String,
    /// Model identifier, empty for deterministic providers.
    pub model: String,
    /// When generation finished.
    pub generated_at: UtcTimestamp,
}

/// Generates release notes for a run.
#[async_trait]
pub trait NotesGenerator: Send + Sync {
    /// Generate notes for the run with the given options.
    async fn generate(
        &self,
        run: &ReleaseRun,
        options: &NotesOptions,
    ) -> Result<NotesOutput, NotesError>;

    /// A stable fingerprint over everything generation would consume.
    ///
    /// Two calls with identical inputs must return identical hashes so
    /// orchestrators can skip regeneration.
    fn compute_inputs_hash(&self, run: &ReleaseRun, options: &NotesOptions) -> String;
}

/// Errors from step publishing.
#[derive(Debug, Error)]
pub enum PublisherError {
    /// No handler for this step type.
    #[error("unknown step type: {0}")]
    UnknownStepType(String),

    /// A `plugin` step without plugin coordinates.
    #[error("step '{0}' is a plugin step but names no plugin or hook")]
    MissingPluginCoordinates(String),

    /// Underlying git failure.
    #[error("git error: {0}")]
    Git(String),
}

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Whether the step succeeded.
    pub success: bool,
    /// Captured output for the step status.
    pub output: String,
    /// Failure message when `success` is false.
    pub error: Option<String>,
    /// The step found its effect already applied externally.
    pub already_done: bool,
}

impl StepOutcome {
    /// A successful outcome with output.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            already_done: false,
        }
    }

    /// A failed outcome with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            already_done: false,
        }
    }

    /// The effect was already applied externally.
    pub fn already_done(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            already_done: true,
        }
    }
}

/// Executes publishing steps against external systems.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Execute one step. A failing step is a `Ok(StepOutcome{success:
    /// false, ..})`; `Err` is reserved for the publisher itself being
    /// unable to run the step at all.
    async fn execute_step(
        &self,
        run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<StepOutcome, PublisherError>;

    /// Whether the step's effect is already applied externally (e.g. the
    /// tag already exists). A `true` lets the orchestrator skip the step.
    async fn check_idempotency(
        &self,
        run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<bool, PublisherError>;
}
