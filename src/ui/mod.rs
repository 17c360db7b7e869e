//! ui
//!
//! User-facing output utilities.
//!
//! # Modules
//!
//! - [`output`] - Output formatting and display
//!
//! # Design
//!
//! All human-facing output goes through this module so verbosity and
//! formatting stay consistent. Structured diagnostics go through
//! `tracing` instead; the two never mix.

pub mod output;
