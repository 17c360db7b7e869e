//! store::lock
//!
//! Advisory repository lock for capstan mutations.
//!
//! # Architecture
//!
//! The lock excludes concurrent mutating operations on one repository
//! across processes on a single host. It is a lock *file* created with
//! exclusive create-only semantics; the file's JSON content identifies
//! the holder so a contender can report who owns the repository and
//! reclaim locks abandoned by crashed processes.
//!
//! # Storage
//!
//! - `.capstan/releases/lock` - JSON: `{run_id, pid, hostname, acquired_at}`
//!
//! # Invariants
//!
//! - Acquisition is non-blocking: contention is an error, never a wait
//! - A lock older than the stale threshold (default 10 minutes) is
//!   presumed abandoned and reclaimed
//! - The guard deletes the lock file on drop (RAII), so the lock is
//!   released on every exit path including panics
//! - Reads are never guarded; only mutations take the lock
//!
//! # Example
//!
//! ```ignore
//! use capstan::store::lock::ReleaseLockManager;
//!
//! let locks = ReleaseLockManager::new();
//! let guard = locks.acquire(&paths, &run_id)?;
//! // ... mutate and persist the run ...
//! drop(guard); // lock file removed
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::paths::StorePaths;
use crate::core::types::{RunId, UtcTimestamp};

/// Default age after which a lock is presumed abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(600);

/// Another process holds the repository lock.
#[derive(Debug, Clone, Error)]
#[error("repository is locked by pid {holder_pid} on {hostname} (run {run_id}, since {acquired_at})")]
pub struct LockHeldError {
    /// The holder's process id.
    pub holder_pid: u32,
    /// The holder's hostname.
    pub hostname: String,
    /// The run the holder is working on.
    pub run_id: RunId,
    /// When the holder acquired the lock.
    pub acquired_at: UtcTimestamp,
}

/// Errors from locking operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process already holds the lock.
    #[error(transparent)]
    Held(#[from] LockHeldError),

    /// Failed to create the lock file or its directory.
    #[error("failed to create lock: {0}")]
    CreateFailed(String),

    /// I/O error during lock operations.
    #[error("lock i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock file content identifying the holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// The run being mutated.
    pub run_id: RunId,
    /// Holder process id.
    pub pid: u32,
    /// Holder hostname.
    pub hostname: String,
    /// When the lock was taken.
    pub acquired_at: UtcTimestamp,
}

/// Per-host advisory lock manager with stale-lock reclamation.
#[derive(Debug, Clone)]
pub struct ReleaseLockManager {
    stale_threshold: Duration,
}

impl Default for ReleaseLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseLockManager {
    /// Create a manager with the default 10-minute stale threshold.
    pub fn new() -> Self {
        Self {
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Create a manager with a custom stale threshold.
    pub fn with_stale_threshold(stale_threshold: Duration) -> Self {
        Self { stale_threshold }
    }

    /// Attempt to acquire the repository lock.
    ///
    /// Non-blocking: if another live holder owns the lock this returns
    /// [`LockError::Held`] immediately. A stale lock (older than the
    /// threshold) is deleted first, after which creation is retried; the
    /// create-only file open arbitrates races between contenders.
    ///
    /// # Errors
    ///
    /// - [`LockError::Held`] when a non-stale holder exists
    /// - [`LockError::CreateFailed`] when the lock directory cannot be
    ///   created
    pub fn acquire(&self, paths: &StorePaths, run_id: &RunId) -> Result<LockGuard, LockError> {
        let lock_path = paths.lock_path();
        let dir = paths.releases_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| LockError::CreateFailed(format!("cannot create {}: {e}", dir.display())))?;

        match self.read_info(paths)? {
            Some(existing) if self.is_stale(&existing) => {
                tracing::warn!(
                    holder_pid = existing.pid,
                    acquired_at = %existing.acquired_at,
                    "reclaiming stale repository lock"
                );
                // Best-effort: a racing contender may have removed it already.
                let _ = fs::remove_file(&lock_path);
            }
            Some(_) => {}
            None => {
                // Unreadable lock content. Reclaim only when the file itself
                // is old: a freshly created lock may simply not be written
                // yet by the winning contender.
                if let Ok(meta) = fs::metadata(&lock_path) {
                    let old = meta
                        .modified()
                        .ok()
                        .and_then(|m| m.elapsed().ok())
                        .map(|age| age > self.stale_threshold)
                        .unwrap_or(false);
                    if old {
                        tracing::warn!("reclaiming unreadable stale lock file");
                        let _ = fs::remove_file(&lock_path);
                    }
                }
            }
        }

        // Exclusive create arbitrates the race: exactly one contender wins.
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return match self.read_info(paths)? {
                    Some(info) => Err(LockError::Held(LockHeldError {
                        holder_pid: info.pid,
                        hostname: info.hostname,
                        run_id: info.run_id,
                        acquired_at: info.acquired_at,
                    })),
                    // The winner has created but not yet written the file.
                    None => Err(LockError::Held(LockHeldError {
                        holder_pid: 0,
                        hostname: String::new(),
                        run_id: run_id.clone(),
                        acquired_at: UtcTimestamp::now(),
                    })),
                };
            }
            Err(e) => return Err(LockError::Io(e)),
        };

        let info = LockInfo {
            run_id: run_id.clone(),
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: UtcTimestamp::now(),
        };
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| LockError::CreateFailed(e.to_string()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        Ok(LockGuard {
            path: lock_path,
            held: true,
        })
    }

    /// Try to acquire the lock, returning `None` if already held.
    pub fn try_acquire(
        &self,
        paths: &StorePaths,
        run_id: &RunId,
    ) -> Result<Option<LockGuard>, LockError> {
        match self.acquire(paths, run_id) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Held(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check whether a non-stale lock exists.
    pub fn is_locked(&self, paths: &StorePaths) -> bool {
        match self.read_info(paths) {
            Ok(Some(info)) => !self.is_stale(&info),
            _ => false,
        }
    }

    /// Read the holder metadata, if a lock file exists.
    ///
    /// A lock file that cannot be parsed is reported as `None`; acquire
    /// treats it as stale.
    pub fn lock_info(&self, paths: &StorePaths) -> Result<Option<LockInfo>, LockError> {
        self.read_info(paths)
    }

    fn read_info(&self, paths: &StorePaths) -> Result<Option<LockInfo>, LockError> {
        let content = match fs::read_to_string(paths.lock_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io(e)),
        };
        match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable lock file content");
                Ok(None)
            }
        }
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        let age = info.acquired_at.seconds_until(&UtcTimestamp::now());
        age >= 0 && age as u64 > self.stale_threshold.as_secs()
    }
}

/// A held repository lock.
///
/// Deleting the lock file releases the lock; this happens automatically
/// on drop so the lock survives no exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    held: bool,
}

impl LockGuard {
    /// Check if this guard still holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lock explicitly.
    ///
    /// Called automatically on drop; explicit release lets callers
    /// surface deletion errors.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.held {
            self.held = false;
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::Io(e)),
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// The local hostname, or `unknown` when it cannot be read.
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of the stated length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StorePaths) {
        let temp = TempDir::new().expect("create temp dir");
        let paths = StorePaths::new(temp.path());
        (temp, paths)
    }

    fn run_id(name: &str) -> RunId {
        RunId::new(name).unwrap()
    }

    #[test]
    fn acquire_succeeds_and_writes_holder_info() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        let guard = locks.acquire(&paths, &run_id("run-1")).expect("acquire");
        assert!(guard.is_held());

        let info = locks.lock_info(&paths).unwrap().expect("lock info");
        assert_eq!(info.run_id, run_id("run-1"));
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
    }

    #[test]
    fn second_acquire_reports_holder() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        let _guard = locks.acquire(&paths, &run_id("run-1")).expect("acquire");
        let err = locks.acquire(&paths, &run_id("run-2")).unwrap_err();
        match err {
            LockError::Held(held) => {
                assert_eq!(held.holder_pid, std::process::id());
                assert_eq!(held.run_id, run_id("run-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn try_acquire_returns_none_when_locked() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        let _guard = locks.acquire(&paths, &run_id("run-1")).expect("acquire");
        assert!(locks
            .try_acquire(&paths, &run_id("run-2"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn try_acquire_returns_guard_when_free() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();
        let guard = locks
            .try_acquire(&paths, &run_id("run-1"))
            .unwrap()
            .expect("should get lock");
        assert!(guard.is_held());
    }

    #[test]
    fn released_on_drop() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        {
            let _guard = locks.acquire(&paths, &run_id("run-1")).expect("acquire");
            assert!(locks.is_locked(&paths));
        }
        assert!(!locks.is_locked(&paths));
        assert!(locks.acquire(&paths, &run_id("run-2")).is_ok());
    }

    #[test]
    fn explicit_release_is_idempotent() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        let mut guard = locks.acquire(&paths, &run_id("run-1")).expect("acquire");
        guard.release().expect("first release");
        guard.release().expect("second release is a no-op");
        assert!(!guard.is_held());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        // Simulate a crashed holder: a lock acquired 11 minutes ago.
        paths.ensure_dirs().unwrap();
        let old = LockInfo {
            run_id: run_id("run-1"),
            pid: 999_999,
            hostname: "elsewhere".into(),
            acquired_at: UtcTimestamp::from_datetime(
                chrono::Utc::now() - chrono::Duration::minutes(11),
            ),
        };
        fs::write(paths.lock_path(), serde_json::to_string(&old).unwrap()).unwrap();

        assert!(!locks.is_locked(&paths));
        let guard = locks
            .acquire(&paths, &run_id("run-2"))
            .expect("stale lock reclaimed");
        assert!(guard.is_held());
        let info = locks.lock_info(&paths).unwrap().unwrap();
        assert_eq!(info.run_id, run_id("run-2"));
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        paths.ensure_dirs().unwrap();
        let fresh = LockInfo {
            run_id: run_id("run-1"),
            pid: 999_999,
            hostname: "elsewhere".into(),
            acquired_at: UtcTimestamp::now(),
        };
        fs::write(paths.lock_path(), serde_json::to_string(&fresh).unwrap()).unwrap();

        assert!(locks.is_locked(&paths));
        assert!(matches!(
            locks.acquire(&paths, &run_id("run-2")).unwrap_err(),
            LockError::Held(_)
        ));
    }

    #[test]
    fn corrupt_lock_is_treated_as_stale() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::new();

        paths.ensure_dirs().unwrap();
        fs::write(paths.lock_path(), "not json at all").unwrap();

        assert!(!locks.is_locked(&paths));
        assert!(locks.lock_info(&paths).unwrap().is_none());
    }

    #[test]
    fn custom_stale_threshold() {
        let (_temp, paths) = setup();
        let locks = ReleaseLockManager::with_stale_threshold(Duration::from_secs(1));

        paths.ensure_dirs().unwrap();
        let old = LockInfo {
            run_id: run_id("run-1"),
            pid: 999_999,
            hostname: "elsewhere".into(),
            acquired_at: UtcTimestamp::from_datetime(
                chrono::Utc::now() - chrono::Duration::seconds(5),
            ),
        };
        fs::write(paths.lock_path(), serde_json::to_string(&old).unwrap()).unwrap();
        assert!(!locks.is_locked(&paths));
    }
}
