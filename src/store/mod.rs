//! store
//!
//! Durable persistence for release runs.
//!
//! # Modules
//!
//! - [`repository`] - Atomic run snapshots, latest pointer, queries
//! - [`lock`] - Advisory repository lock with stale reclamation
//! - [`journal`] - Append-only per-run event journal
//!
//! # Ownership
//!
//! The run store exclusively owns snapshot files, the lock manager the
//! lock file, and the journal the `.events.jsonl` files. Mutable file
//! handles are never shared between components.

pub mod journal;
pub mod lock;
pub mod repository;

pub use journal::{EventEnvelope, EventJournal, JournalError};
pub use lock::{LockError, LockGuard, LockHeldError, LockInfo, ReleaseLockManager};
pub use repository::{RunStore, StateProjection, StoreError};
