//! store::repository
//!
//! Atomic persistence of run snapshots.
//!
//! # Architecture
//!
//! The run store owns every file under `.capstan/releases/` except the
//! lock. Each run has a canonical snapshot (`<id>.json`), a minimal
//! state projection (`<id>.state.json`) for cheap inspection, and a
//! state-machine export (`<id>.machine.json`) written once at plan time.
//! The `latest` pointer names the repository's current run.
//!
//! # Atomic-write contract
//!
//! Every write is: serialize, write to `<target>.tmp` with fsync, rename
//! to `<target>`. On rename failure the temp file is removed. Partial
//! state is never observable under `<target>`.
//!
//! # Invariants
//!
//! - Persistence within one process is serialized by the store's writer
//!   mutex, held only for the duration of I/O
//! - `save` transfers the aggregate's buffered events to the journal;
//!   a journal failure is logged and does not fail the save (the
//!   snapshot is authoritative, the journal observational)
//! - Readers tolerate a dangling `latest` pointer by reporting
//!   [`StoreError::RunNotFound`]

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::journal::EventJournal;
use crate::core::machine;
use crate::core::paths::StorePaths;
use crate::core::run::ReleaseRun;
use crate::core::types::{RunId, RunState, UtcTimestamp};

/// Errors from run persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No such run under this repository.
    #[error("run not found")]
    RunNotFound,

    /// I/O failure.
    #[error("store i/o error at '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Snapshot serialization failure.
    #[error("failed to serialize run: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Snapshot parse failure.
    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },

    /// Run id stored on disk fails validation.
    #[error("invalid run id in store: {0}")]
    InvalidRunId(String),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Minimal projection of a run for cheap inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateProjection {
    /// The run id.
    pub id: RunId,
    /// Current workflow state.
    pub state: RunState,
    /// Current plan hash.
    pub plan_hash: String,
    /// Assessed risk.
    pub risk_score: f64,
    /// Decided next version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_next: Option<String>,
    /// Tag to be created, if decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    /// Last mutation time.
    pub updated_at: UtcTimestamp,
    /// Publication time, once published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<UtcTimestamp>,
}

impl StateProjection {
    fn of(run: &ReleaseRun) -> Self {
        Self {
            id: run.id.clone(),
            state: run.state,
            plan_hash: run.plan_hash.clone(),
            risk_score: run.risk_score,
            version_next: run.version_next.as_ref().map(|v| v.to_string()),
            tag_name: run.tag_name.clone(),
            updated_at: run.updated_at,
            published_at: run.published_at,
        }
    }
}

/// Run snapshot store with atomic writes and journal hand-off.
#[derive(Debug, Default)]
pub struct RunStore {
    journal: EventJournal,
    write_lock: Mutex<()>,
}

impl RunStore {
    /// Create a store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The journal this store publishes events to.
    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Persist a run: snapshot + state projection, then hand buffered
    /// events to the journal and clear the buffer.
    ///
    /// A journal append failure is logged and swallowed; the snapshot
    /// write is what makes the save authoritative.
    pub fn save(&self, run: &mut ReleaseRun) -> Result<(), StoreError> {
        let paths = StorePaths::new(&run.repo_root);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(&paths.releases_dir(), e))?;

        {
            let _guard = self.write_lock.lock().expect("store mutex poisoned");
            let snapshot = serde_json::to_vec_pretty(run)?;
            atomic_write(&paths.run_snapshot_path(&run.id), &snapshot)?;

            let projection = serde_json::to_vec_pretty(&StateProjection::of(run))?;
            atomic_write(&paths.run_state_path(&run.id), &projection)?;
        }

        let events = run.take_events();
        if let Err(e) = self.journal.append(&paths, &events) {
            tracing::warn!(run_id = %run.id, error = %e, "event journal append failed");
        }
        Ok(())
    }

    /// Write the run's state-machine export. Called once at plan time.
    pub fn write_machine_export(&self, run: &ReleaseRun) -> Result<(), StoreError> {
        let paths = StorePaths::new(&run.repo_root);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(&paths.releases_dir(), e))?;
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        let export = serde_json::to_vec_pretty(&machine::export())?;
        atomic_write(&paths.run_machine_path(&run.id), &export)
    }

    /// Load a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] when no snapshot exists.
    pub fn load_from_repo(&self, repo_root: &Path, run_id: &RunId) -> Result<ReleaseRun, StoreError> {
        let paths = StorePaths::new(repo_root);
        let path = paths.run_snapshot_path(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::RunNotFound)
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load the run named by the `latest` pointer.
    ///
    /// A missing or dangling pointer is [`StoreError::RunNotFound`].
    pub fn load_latest(&self, repo_root: &Path) -> Result<ReleaseRun, StoreError> {
        let paths = StorePaths::new(repo_root);
        let pointer = match fs::read_to_string(paths.latest_path()) {
            Ok(pointer) => pointer,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::RunNotFound)
            }
            Err(e) => return Err(io_err(&paths.latest_path(), e)),
        };
        let run_id = RunId::new(pointer.trim())
            .map_err(|e| StoreError::InvalidRunId(e.to_string()))?;
        self.load_from_repo(repo_root, &run_id)
    }

    /// Point `latest` at a run. Atomic.
    pub fn set_latest(&self, repo_root: &Path, run_id: &RunId) -> Result<(), StoreError> {
        let paths = StorePaths::new(repo_root);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(&paths.releases_dir(), e))?;
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        atomic_write(&paths.latest_path(), run_id.as_str().as_bytes())
    }

    /// List run ids sorted by snapshot modification time, newest first.
    pub fn list(&self, repo_root: &Path) -> Result<Vec<RunId>, StoreError> {
        let paths = StorePaths::new(repo_root);
        let dir = paths.releases_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(RunId, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Only canonical snapshots: skip projections, exports, pointer, lock.
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.ends_with(".state") || stem.ends_with(".machine") {
                continue;
            }
            let Ok(run_id) = RunId::new(stem) else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            entries.push((run_id, mtime));
        }

        entries.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }

    /// Delete a run's snapshot, projection, and machine export.
    ///
    /// Idempotent: absent files are not an error. The event journal is
    /// never deleted.
    pub fn delete_from_repo(&self, repo_root: &Path, run_id: &RunId) -> Result<(), StoreError> {
        let paths = StorePaths::new(repo_root);
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        for path in [
            paths.run_snapshot_path(run_id),
            paths.run_state_path(run_id),
            paths.run_machine_path(run_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        Ok(())
    }

    /// Load all runs currently stored for a repository.
    pub fn load_all(&self, repo_root: &Path) -> Result<Vec<ReleaseRun>, StoreError> {
        let mut runs = Vec::new();
        for run_id in self.list(repo_root)? {
            match self.load_from_repo(repo_root, &run_id) {
                Ok(run) => runs.push(run),
                // A concurrent delete between list and load is not an error.
                Err(StoreError::RunNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(runs)
    }

    /// All runs in a given state.
    pub fn find_by_state(
        &self,
        repo_root: &Path,
        state: RunState,
    ) -> Result<Vec<ReleaseRun>, StoreError> {
        Ok(self
            .load_all(repo_root)?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    /// All active runs: non-terminal and past `draft`.
    pub fn find_active(&self, repo_root: &Path) -> Result<Vec<ReleaseRun>, StoreError> {
        Ok(self
            .load_all(repo_root)?
            .into_iter()
            .filter(|r| r.state.is_active())
            .collect())
    }

    /// The run bound to a plan hash, if one exists.
    pub fn find_by_plan_hash(
        &self,
        repo_root: &Path,
        plan_hash: &str,
    ) -> Result<Option<ReleaseRun>, StoreError> {
        Ok(self
            .load_all(repo_root)?
            .into_iter()
            .find(|r| r.plan_hash == plan_hash))
    }
}

/// Write bytes atomically: temp file + fsync + rename.
///
/// On rename failure the temp file is removed so no `.tmp` debris
/// accumulates.
fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = target.with_extension(match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });

    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        std::io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(target, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::machine::GuardContext;
    use crate::core::run::NewRunParams;
    use crate::core::types::{Actor, CommitSha, RiskThresholds};
    use tempfile::TempDir;

    fn sha(c: char) -> CommitSha {
        CommitSha::new(c.to_string().repeat(40)).unwrap()
    }

    fn new_run(repo_root: &Path) -> ReleaseRun {
        ReleaseRun::new(NewRunParams {
            repo_id: "org/app".into(),
            repo_root: repo_root.to_path_buf(),
            base_ref: "v1.0.0".into(),
            head_sha: sha('a'),
            commits: vec![sha('a'), sha('b')],
            config_hash: "cfg".into(),
            plugin_plan_hash: "plg".into(),
            actor: Actor::human("alice"),
            thresholds: RiskThresholds::default(),
        })
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());

        store.save(&mut run).unwrap();
        let loaded = store.load_from_repo(temp.path(), &run.id).unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.plan_hash, run.plan_hash);
    }

    #[test]
    fn save_publishes_events_and_clears_buffer() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        assert!(!run.domain_events.is_empty());

        store.save(&mut run).unwrap();
        assert!(run.domain_events.is_empty());

        let paths = StorePaths::new(temp.path());
        let events = store.journal().load_events(&paths, &run.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "run.created");
        assert_eq!(events[0].sequence_num, 1);
    }

    #[test]
    fn saves_accumulate_journal_in_emission_order() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        store.save(&mut run).unwrap();

        run.plan(&Actor::human("alice"), &GuardContext::default())
            .unwrap();
        store.save(&mut run).unwrap();

        let paths = StorePaths::new(temp.path());
        let events = store.journal().load_events(&paths, &run.id).unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["run.created", "run.state_transitioned", "run.planned"]
        );
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn load_missing_run_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let err = store
            .load_from_repo(temp.path(), &RunId::new("nope").unwrap())
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound));
    }

    #[test]
    fn latest_pointer_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        store.save(&mut run).unwrap();
        store.set_latest(temp.path(), &run.id).unwrap();

        let latest = store.load_latest(temp.path()).unwrap();
        assert_eq!(latest.id, run.id);
    }

    #[test]
    fn missing_latest_pointer_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        assert!(matches!(
            store.load_latest(temp.path()).unwrap_err(),
            StoreError::RunNotFound
        ));
    }

    #[test]
    fn dangling_latest_pointer_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let paths = StorePaths::new(temp.path());
        paths.ensure_dirs().unwrap();
        fs::write(paths.latest_path(), "gone-run").unwrap();

        assert!(matches!(
            store.load_latest(temp.path()).unwrap_err(),
            StoreError::RunNotFound
        ));
    }

    #[test]
    fn list_skips_projections_and_exports() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        store.save(&mut run).unwrap();
        store.write_machine_export(&run).unwrap();

        let ids = store.list(temp.path()).unwrap();
        assert_eq!(ids, vec![run.id.clone()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        store.save(&mut run).unwrap();
        store.write_machine_export(&run).unwrap();

        store.delete_from_repo(temp.path(), &run.id).unwrap();
        assert!(matches!(
            store.load_from_repo(temp.path(), &run.id).unwrap_err(),
            StoreError::RunNotFound
        ));
        // Second delete: nothing left, still ok.
        store.delete_from_repo(temp.path(), &run.id).unwrap();
    }

    #[test]
    fn find_queries() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let actor = Actor::human("alice");

        let mut draft = new_run(temp.path());
        store.save(&mut draft).unwrap();

        let mut planned = new_run(temp.path());
        planned.plan(&actor, &GuardContext::default()).unwrap();
        store.save(&mut planned).unwrap();

        let by_state = store
            .find_by_state(temp.path(), RunState::Planned)
            .unwrap();
        assert_eq!(by_state.len(), 1);
        assert_eq!(by_state[0].id, planned.id);

        // Active excludes draft.
        let active = store.find_active(temp.path()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, planned.id);

        let by_hash = store
            .find_by_plan_hash(temp.path(), &planned.plan_hash)
            .unwrap();
        assert!(by_hash.is_some());
        assert!(store
            .find_by_plan_hash(temp.path(), "no-such-hash")
            .unwrap()
            .is_none());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_debris() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.json");
        atomic_write(&target, b"{}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}");

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn state_projection_written_alongside_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let mut run = new_run(temp.path());
        store.save(&mut run).unwrap();

        let paths = StorePaths::new(temp.path());
        let content = fs::read_to_string(paths.run_state_path(&run.id)).unwrap();
        let projection: StateProjection = serde_json::from_str(&content).unwrap();
        assert_eq!(projection.id, run.id);
        assert_eq!(projection.state, RunState::Draft);
    }

    #[test]
    fn machine_export_written_once_at_plan_time() {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new();
        let run = new_run(temp.path());
        store.write_machine_export(&run).unwrap();

        let paths = StorePaths::new(temp.path());
        let content = fs::read_to_string(paths.run_machine_path(&run.id)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["initial"], "draft");
        assert!(value["states"]["publishing"]["on"]["PUBLISH_COMPLETE"].is_object());
    }
}
