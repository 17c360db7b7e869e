//! Capstan - release governance for Git repositories
//!
//! Capstan is a per-repository release-governance engine: a durable
//! state machine that takes a working tree from "change detected" to
//! "release published" with cross-process exclusion, idempotent
//! publishing steps, and a tamper-evident audit trail.
//!
//! # Architecture
//!
//! The codebase follows a strict layered architecture:
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to engine)
//! - [`engine`] - Use-case orchestrators, one per command
//! - [`core`] - Domain types, the release-run aggregate, and the state machine
//! - [`store`] - Atomic snapshots, advisory locking, and the event journal
//! - [`collab`] - Collaborator seams: git inspection, version writing,
//!   notes generation, step publishing
//! - [`plugin`] - Sandboxed plugin host with admission control and audit
//! - [`ui`] - User-facing output utilities
//!
//! # Correctness Invariants
//!
//! Capstan maintains the following invariants:
//!
//! 1. Every state change flows through the aggregate and its guard checks;
//!    a rejected transition leaves the run unchanged
//! 2. Snapshots are written atomically; partial state is never observable
//! 3. One writer per repository, enforced across processes by the
//!    advisory lock
//! 4. Every plugin execution is sandboxed, time-bounded, and audit-logged

pub mod cli;
pub mod collab;
pub mod core;
pub mod engine;
pub mod plugin;
pub mod store;
pub mod ui;
