//! store::journal
//!
//! Append-only per-run event journal.
//!
//! # Architecture
//!
//! Each run owns one JSON-lines file at
//! `.capstan/events/<run_id>.events.jsonl`. Every line is an envelope:
//!
//! ```text
//! {id, run_id, event_name, occurred_at, stored_at, sequence_num, payload}
//! ```
//!
//! `sequence_num` starts at 1 and increases monotonically per run. The
//! writer reads the current tail to compute the next number under the
//! journal's own mutex, then appends with fsync before the fd closes.
//!
//! # Invariants
//!
//! - Strict append-only: no compaction, no rewriting, no deletes
//! - Unreadable lines are skipped on read, never an error
//! - The journal is observational: the snapshot is authoritative, so
//!   append failures are logged by the caller rather than failing a save

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::events::DomainEvent;
use crate::core::paths::StorePaths;
use crate::core::types::{RunId, UtcTimestamp};

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error reading or writing the journal.
    #[error("journal i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while appending.
    #[error("journal json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One persisted journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique envelope id.
    pub id: String,
    /// The run this event belongs to.
    pub run_id: RunId,
    /// Event name, e.g. `run.state_transitioned`.
    pub event_name: String,
    /// When the event occurred (emission time).
    pub occurred_at: UtcTimestamp,
    /// When the event was persisted.
    pub stored_at: UtcTimestamp,
    /// Monotone per-run sequence number, starting at 1.
    pub sequence_num: u64,
    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Decode the envelope back into a typed domain event.
    ///
    /// Returns `None` for event names this version does not know, so
    /// newer journals remain readable.
    pub fn decode(&self) -> Option<DomainEvent> {
        let mut value = self.payload.clone();
        let obj = value.as_object_mut()?;
        obj.insert(
            "event_name".to_string(),
            serde_json::Value::String(self.event_name.clone()),
        );
        obj.insert(
            "run_id".to_string(),
            serde_json::Value::String(self.run_id.to_string()),
        );
        obj.insert(
            "occurred_at".to_string(),
            serde_json::to_value(self.occurred_at).ok()?,
        );
        serde_json::from_value(value).ok()
    }
}

/// Append-only event journal for release runs.
///
/// The mutex serializes sequence computation and appends within one
/// process; cross-process writers are already excluded by the repository
/// lock.
#[derive(Debug, Default)]
pub struct EventJournal {
    write_lock: Mutex<()>,
}

impl EventJournal {
    /// Create a journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events for a run, in emission order.
    ///
    /// Sequence numbers continue from the current tail. The file is
    /// fsync'd before the descriptor closes.
    pub fn append(
        &self,
        paths: &StorePaths,
        events: &[DomainEvent],
    ) -> Result<(), JournalError> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().expect("journal mutex poisoned");

        fs::create_dir_all(paths.events_dir())?;

        // Events in one batch share a run; group defensively anyway so a
        // mixed batch still lands in the right files.
        let mut by_run: Vec<(&RunId, Vec<&DomainEvent>)> = Vec::new();
        for event in events {
            match by_run.iter_mut().find(|(id, _)| **id == event.run_id) {
                Some((_, bucket)) => bucket.push(event),
                None => by_run.push((&event.run_id, vec![event])),
            }
        }

        for (run_id, batch) in by_run {
            let path = paths.event_log_path(run_id);
            let mut next_seq = self.tail_sequence(paths, run_id)? + 1;

            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = std::io::BufWriter::new(file);
            for event in batch {
                let envelope = EventEnvelope {
                    id: uuid::Uuid::new_v4().to_string(),
                    run_id: event.run_id.clone(),
                    event_name: event.name().to_string(),
                    occurred_at: event.occurred_at,
                    stored_at: UtcTimestamp::now(),
                    sequence_num: next_seq,
                    payload: event.kind.payload(),
                };
                next_seq += 1;
                let line = serde_json::to_string(&envelope)?;
                writeln!(writer, "{line}")?;
            }
            writer.flush()?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        Ok(())
    }

    /// The highest sequence number currently stored for a run (0 if none).
    fn tail_sequence(&self, paths: &StorePaths, run_id: &RunId) -> Result<u64, JournalError> {
        Ok(self
            .read_envelopes(paths, run_id)?
            .last()
            .map(|e| e.sequence_num)
            .unwrap_or(0))
    }

    /// Load all events for a run, in stored order.
    pub fn load_events(
        &self,
        paths: &StorePaths,
        run_id: &RunId,
    ) -> Result<Vec<EventEnvelope>, JournalError> {
        self.read_envelopes(paths, run_id)
    }

    /// Load events for a run occurring at or after `since`.
    pub fn load_events_since(
        &self,
        paths: &StorePaths,
        run_id: &RunId,
        since: UtcTimestamp,
    ) -> Result<Vec<EventEnvelope>, JournalError> {
        Ok(self
            .read_envelopes(paths, run_id)?
            .into_iter()
            .filter(|e| e.occurred_at >= since)
            .collect())
    }

    /// Load every event across all runs, sorted by occurrence time.
    pub fn load_all_events(&self, paths: &StorePaths) -> Result<Vec<EventEnvelope>, JournalError> {
        let dir = paths.events_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut all = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(run_id) = name.strip_suffix(".events.jsonl") else {
                continue;
            };
            let Ok(run_id) = RunId::new(run_id) else {
                continue;
            };
            all.extend(self.read_envelopes(paths, &run_id)?);
        }
        all.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(all)
    }

    fn read_envelopes(
        &self,
        paths: &StorePaths,
        run_id: &RunId,
    ) -> Result<Vec<EventEnvelope>, JournalError> {
        let path = paths.event_log_path(run_id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JournalError::Io(e)),
        };

        let mut envelopes = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventEnvelope>(&line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable journal line");
                }
            }
        }
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventKind;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StorePaths, EventJournal) {
        let temp = TempDir::new().expect("create temp dir");
        let paths = StorePaths::new(temp.path());
        (temp, paths, EventJournal::new())
    }

    fn run_id(name: &str) -> RunId {
        RunId::new(name).unwrap()
    }

    fn planned_event(run: &str, hash: &str) -> DomainEvent {
        DomainEvent::now(
            run_id(run),
            EventKind::Planned {
                plan_hash: hash.into(),
                commit_count: 1,
            },
        )
    }

    #[test]
    fn append_assigns_monotone_sequence() {
        let (_temp, paths, journal) = setup();
        let id = run_id("run-1");

        journal
            .append(&paths, &[planned_event("run-1", "a"), planned_event("run-1", "b")])
            .unwrap();
        journal.append(&paths, &[planned_event("run-1", "c")]).unwrap();

        let events = journal.load_events(&paths, &id).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn envelopes_carry_name_and_payload() {
        let (_temp, paths, journal) = setup();
        journal
            .append(&paths, &[planned_event("run-1", "deadbeef")])
            .unwrap();

        let events = journal.load_events(&paths, &run_id("run-1")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "run.planned");
        assert_eq!(events[0].payload["plan_hash"], "deadbeef");
        assert!(events[0].payload.get("event_name").is_none());
    }

    #[test]
    fn decode_round_trips_known_events() {
        let (_temp, paths, journal) = setup();
        let original = planned_event("run-1", "cafe");
        journal.append(&paths, std::slice::from_ref(&original)).unwrap();

        let events = journal.load_events(&paths, &run_id("run-1")).unwrap();
        let decoded = events[0].decode().expect("known event decodes");
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_event_names_decode_to_none() {
        let envelope = EventEnvelope {
            id: "x".into(),
            run_id: run_id("run-1"),
            event_name: "run.from_the_future".into(),
            occurred_at: UtcTimestamp::now(),
            stored_at: UtcTimestamp::now(),
            sequence_num: 1,
            payload: serde_json::json!({"anything": true}),
        };
        assert!(envelope.decode().is_none());
    }

    #[test]
    fn missing_log_reads_empty() {
        let (_temp, paths, journal) = setup();
        assert!(journal
            .load_events(&paths, &run_id("run-1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unreadable_lines_are_skipped() {
        let (_temp, paths, journal) = setup();
        journal.append(&paths, &[planned_event("run-1", "a")]).unwrap();

        // Corrupt the middle of the log by hand.
        let path = paths.event_log_path(&run_id("run-1"));
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("this is not json\n");
        fs::write(&path, content).unwrap();
        journal.append(&paths, &[planned_event("run-1", "b")]).unwrap();

        let events = journal.load_events(&paths, &run_id("run-1")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence_num, 2);
    }

    #[test]
    fn load_events_since_filters() {
        let (_temp, paths, journal) = setup();
        journal.append(&paths, &[planned_event("run-1", "a")]).unwrap();

        let cutoff = UtcTimestamp::from_datetime(chrono::Utc::now() + chrono::Duration::hours(1));
        assert!(journal
            .load_events_since(&paths, &run_id("run-1"), cutoff)
            .unwrap()
            .is_empty());

        let past = UtcTimestamp::from_datetime(chrono::Utc::now() - chrono::Duration::hours(1));
        assert_eq!(
            journal
                .load_events_since(&paths, &run_id("run-1"), past)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn load_all_events_merges_runs_sorted() {
        let (_temp, paths, journal) = setup();
        journal.append(&paths, &[planned_event("run-1", "a")]).unwrap();
        journal.append(&paths, &[planned_event("run-2", "b")]).unwrap();
        journal.append(&paths, &[planned_event("run-1", "c")]).unwrap();

        let all = journal.load_all_events(&paths).unwrap();
        assert_eq!(all.len(), 3);
        for pair in all.windows(2) {
            assert!(pair[0].occurred_at <= pair[1].occurred_at);
        }
    }

    #[test]
    fn mixed_batch_lands_in_separate_files() {
        let (_temp, paths, journal) = setup();
        journal
            .append(
                &paths,
                &[planned_event("run-1", "a"), planned_event("run-2", "b")],
            )
            .unwrap();

        assert_eq!(journal.load_events(&paths, &run_id("run-1")).unwrap().len(), 1);
        assert_eq!(journal.load_events(&paths, &run_id("run-2")).unwrap().len(), 1);
    }
}
