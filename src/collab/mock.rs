//! collab::mock
//!
//! Mock collaborators for deterministic testing.
//!
//! # Design
//!
//! Each mock stores its state behind `Arc<Mutex<...>>` so tests can hold
//! a clone for assertions while the engine holds another. Failure
//! scenarios are configured up front; recorded operations are inspected
//! afterwards.
//!
//! # Example
//!
//! ```
//! use capstan::collab::mock::MockInspector;
//! use capstan::collab::RepoInspector;
//! use capstan::core::types::CommitSha;
//!
//! # tokio_test::block_on(async {
//! let sha = CommitSha::new("a".repeat(40)).unwrap();
//! let inspector = MockInspector::new(sha.clone());
//! assert_eq!(inspector.head_sha().await.unwrap(), sha);
//! # });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::traits::{
    InspectorError, NotesError, NotesGenerator, NotesOptions, NotesOutput, Publisher,
    PublisherError, RepoInspector, StepOutcome, VersionWriter, WriterError,
};
use crate::core::run::{ReleaseRun, StepPlan};
use crate::core::types::{CommitSha, UtcTimestamp};
use crate::core::version::Version;

/// Mock repository inspector with settable state.
#[derive(Debug, Clone)]
pub struct MockInspector {
    inner: Arc<Mutex<MockInspectorInner>>,
}

#[derive(Debug)]
struct MockInspectorInner {
    head: CommitSha,
    clean: bool,
    commits: Vec<CommitSha>,
    remote_url: Option<String>,
    branch: String,
    latest_tag: Option<(String, Version)>,
    tags: HashSet<String>,
    releases: HashSet<String>,
}

impl MockInspector {
    /// Create an inspector whose HEAD is `head`.
    pub fn new(head: CommitSha) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInspectorInner {
                head,
                clean: true,
                commits: Vec::new(),
                remote_url: Some("git@github.com:acme/widgets.git".into()),
                branch: "main".into(),
                latest_tag: None,
                tags: HashSet::new(),
                releases: HashSet::new(),
            })),
        }
    }

    /// Move HEAD (simulates out-of-band commits).
    pub fn set_head(&self, head: CommitSha) {
        self.inner.lock().unwrap().head = head;
    }

    /// Set the commit window returned by `resolve_commits`.
    pub fn set_commits(&self, commits: Vec<CommitSha>) {
        self.inner.lock().unwrap().commits = commits;
    }

    /// Set the latest version tag.
    pub fn set_latest_tag(&self, name: &str, version: Version) {
        self.inner.lock().unwrap().latest_tag = Some((name.to_string(), version));
    }

    /// Record an existing tag.
    pub fn add_tag(&self, name: &str) {
        self.inner.lock().unwrap().tags.insert(name.to_string());
    }

    /// Record an existing forge release.
    pub fn add_release(&self, name: &str) {
        self.inner.lock().unwrap().releases.insert(name.to_string());
    }

    /// Mark the working tree dirty.
    pub fn set_dirty(&self) {
        self.inner.lock().unwrap().clean = false;
    }
}

#[async_trait]
impl RepoInspector for MockInspector {
    async fn head_sha(&self) -> Result<CommitSha, InspectorError> {
        Ok(self.inner.lock().unwrap().head.clone())
    }

    async fn is_clean(&self) -> Result<bool, InspectorError> {
        Ok(self.inner.lock().unwrap().clean)
    }

    async fn resolve_commits(
        &self,
        _base_ref: &str,
        _head: &CommitSha,
    ) -> Result<Vec<CommitSha>, InspectorError> {
        Ok(self.inner.lock().unwrap().commits.clone())
    }

    async fn remote_url(&self) -> Result<Option<String>, InspectorError> {
        Ok(self.inner.lock().unwrap().remote_url.clone())
    }

    async fn current_branch(&self) -> Result<String, InspectorError> {
        Ok(self.inner.lock().unwrap().branch.clone())
    }

    async fn latest_version_tag(
        &self,
        _prefix: &str,
    ) -> Result<Option<(String, Version)>, InspectorError> {
        Ok(self.inner.lock().unwrap().latest_tag.clone())
    }

    async fn tag_exists(&self, name: &str) -> Result<bool, InspectorError> {
        Ok(self.inner.lock().unwrap().tags.contains(name))
    }

    async fn release_exists(&self, name: &str) -> Result<bool, InspectorError> {
        Ok(self.inner.lock().unwrap().releases.contains(name))
    }
}

/// Mock version writer recording every write.
#[derive(Debug, Clone, Default)]
pub struct MockVersionWriter {
    inner: Arc<Mutex<MockWriterInner>>,
}

#[derive(Debug, Default)]
struct MockWriterInner {
    versions: Vec<Version>,
    changelogs: Vec<(Version, String)>,
}

impl MockVersionWriter {
    /// Create a writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions written so far.
    pub fn written_versions(&self) -> Vec<Version> {
        self.inner.lock().unwrap().versions.clone()
    }

    /// Changelog sections written so far.
    pub fn written_changelogs(&self) -> Vec<(Version, String)> {
        self.inner.lock().unwrap().changelogs.clone()
    }
}

#[async_trait]
impl VersionWriter for MockVersionWriter {
    async fn write_version(&self, version: &Version) -> Result<(), WriterError> {
        self.inner.lock().unwrap().versions.push(version.clone());
        Ok(())
    }

    async fn write_changelog(&self, version: &Version, text: &str) -> Result<(), WriterError> {
        self.inner
            .lock()
            .unwrap()
            .changelogs
            .push((version.clone(), text.to_string()));
        Ok(())
    }
}

/// Mock notes generator with a counted, deterministic output.
#[derive(Debug, Clone, Default)]
pub struct MockNotesGenerator {
    calls: Arc<Mutex<u32>>,
}

impl MockNotesGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `generate` ran.
    pub fn generate_calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl NotesGenerator for MockNotesGenerator {
    async fn generate(
        &self,
        run: &ReleaseRun,
        _options: &NotesOptions,
    ) -> Result<NotesOutput, NotesError> {
        *self.calls.lock().unwrap() += 1;
        let version = run
            .version_next
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unversioned".into());
        Ok(NotesOutput {
            text: format!("release {version}"),
            provider: "mock".into(),
            model: "mock-1".into(),
            generated_at: UtcTimestamp::now(),
        })
    }

    fn compute_inputs_hash(&self, run: &ReleaseRun, options: &NotesOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(run.head_sha.as_str().as_bytes());
        if let Some(version) = &run.version_next {
            hasher.update(version.to_string().as_bytes());
        }
        hasher.update(options.audience.as_bytes());
        hasher.update(options.tone.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Mock publisher with scriptable outcomes.
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    inner: Arc<Mutex<MockPublisherInner>>,
}

#[derive(Debug, Default)]
struct MockPublisherInner {
    /// Step names whose idempotency check reports already-done.
    already_done: HashSet<String>,
    /// Step names that fail, with their error.
    failures: HashMap<String, String>,
    /// Step names executed, in order.
    executed: Vec<String>,
}

impl MockPublisher {
    /// Create a publisher where every step succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a step's idempotency check report already-done.
    pub fn mark_already_done(&self, step: &str) {
        self.inner
            .lock()
            .unwrap()
            .already_done
            .insert(step.to_string());
    }

    /// Make a step fail with an error message.
    pub fn fail_step(&self, step: &str, error: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert(step.to_string(), error.to_string());
    }

    /// Let a previously failing step succeed again.
    pub fn clear_failure(&self, step: &str) {
        self.inner.lock().unwrap().failures.remove(step);
    }

    /// Names of executed steps, in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn execute_step(
        &self,
        _run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<StepOutcome, PublisherError> {
        let mut inner = self.inner.lock().unwrap();
        inner.executed.push(step.name.clone());
        match inner.failures.get(&step.name) {
            Some(error) => Ok(StepOutcome::failed(error.clone())),
            None => Ok(StepOutcome::ok(format!("{} ok", step.name))),
        }
    }

    async fn check_idempotency(
        &self,
        _run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<bool, PublisherError> {
        Ok(self.inner.lock().unwrap().already_done.contains(&step.name))
    }
}
