//! plugin
//!
//! The plugin host: externally supplied publishing extensions run as
//! sandboxed child processes.
//!
//! # Modules
//!
//! - [`admission`] - Name rule and binary path admission control
//! - [`sandbox`] - Env filtering, process groups, best-effort rlimits
//! - [`proto`] - Handshake and JSON-line RPC over child stdio
//! - [`host`] - Lazy loading, bounded concurrent dispatch, teardown
//! - [`audit`] - JSON-lines log of trust-relevant plugin events
//!
//! # Trust model
//!
//! A plugin binary executes only from an allowed directory, after
//! symlink resolution, with an execute bit, under a filtered
//! environment, in its own process group, with best-effort resource
//! limits, and bounded by per-call and global timeouts. Everything it
//! does is audit-logged. From the host's view every plugin is uniform:
//! one interface (`validate`, `execute`), one process per plugin.

pub mod admission;
pub mod audit;
pub mod host;
pub mod proto;
pub mod sandbox;

pub use admission::AdmissionError;
pub use audit::{AuditEntry, AuditEventType, AuditLog};
pub use host::{PluginHost, DEFAULT_PLUGIN_TIMEOUT};
pub use proto::{HookResponse, PluginError, PluginHandle, PluginInfo, ReleaseContext};
