//! plugin::audit
//!
//! JSON-lines audit log of trust-relevant plugin events.
//!
//! # Architecture
//!
//! Every plugin load, unload, execution, error, timeout, and admission
//! rejection produces one line:
//!
//! ```text
//! {timestamp_utc, plugin_name, hook?, event_type, success, duration_ms, error?, metadata?}
//! ```
//!
//! The log is enabled iff a non-empty path was configured. Writes are
//! serialized behind a mutex; the file is opened append-only with 0600
//! permissions. Audit failures never propagate: losing an audit line
//! must not break a release.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::types::UtcTimestamp;

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Plugin child process started and handshook.
    Load,
    /// Plugin child process stopped.
    Unload,
    /// A hook execution completed (successfully or not).
    Execute,
    /// A host-side failure (spawn, protocol, RPC).
    Error,
    /// A per-call timeout fired.
    Timeout,
    /// Admission rejected the binary.
    Rejected,
}

/// One audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event was recorded.
    pub timestamp_utc: UtcTimestamp,
    /// The plugin concerned.
    pub plugin_name: String,
    /// The hook, for execution events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    /// Event kind.
    pub event_type: AuditEventType,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Wall-clock duration in milliseconds (0 for instantaneous events).
    pub duration_ms: u64,
    /// Failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Extra structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEntry {
    /// An entry recorded now for a plugin.
    pub fn now(plugin_name: impl Into<String>, event_type: AuditEventType) -> Self {
        Self {
            timestamp_utc: UtcTimestamp::now(),
            plugin_name: plugin_name.into(),
            hook: None,
            event_type,
            success: true,
            duration_ms: 0,
            error: None,
            metadata: None,
        }
    }

    /// Attach the hook name.
    pub fn hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    /// Set the outcome.
    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Set the duration.
    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach an error message and mark the entry failed.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Concurrent-safe JSON-lines audit logger.
///
/// A logger constructed without a path is disabled: every `record` is a
/// safe no-op.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    /// Create a logger writing to `path`. An empty path disables it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        if path.as_os_str().is_empty() {
            return Self::disabled();
        }
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    /// A disabled logger; `record` does nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    /// Whether this logger writes anywhere.
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append one entry. Never fails; write errors are logged and
    /// dropped.
    pub fn record(&self, entry: AuditEntry) {
        let Some(path) = &self.path else { return };

        let mut guard = self.file.lock().expect("audit mutex poisoned");
        if guard.is_none() {
            match open_append_0600(path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open audit log");
                    return;
                }
            }
        }

        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(error = %e, "audit log write failed");
                *guard = None;
            }
        }
    }
}

fn open_append_0600(path: &std::path::Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
