//! collab
//!
//! External collaborators consumed by the use-case orchestrators.
//!
//! # Modules
//!
//! - [`traits`] - The four collaborator contracts
//! - [`git_inspector`] - git2-backed `RepoInspector` (the crate's single
//!   git doorway)
//! - [`version_writer`] - `VERSION` + `CHANGELOG.md` writer
//! - [`notes_gen`] - Deterministic templated notes generator
//! - [`publisher`] - Default step publisher (`tag` and `plugin` steps)
//! - [`mock`] - In-memory mocks for deterministic tests

pub mod git_inspector;
pub mod mock;
pub mod notes_gen;
pub mod publisher;
pub mod traits;
pub mod version_writer;

pub use git_inspector::GitInspector;
pub use notes_gen::TemplateNotesGenerator;
pub use publisher::HookPublisher;
pub use traits::{
    InspectorError, NotesError, NotesGenerator, NotesOptions, NotesOutput, Publisher,
    PublisherError, RepoInspector, StepOutcome, VersionWriter, WriterError,
};
pub use version_writer::FileVersionWriter;
