//! engine
//!
//! Use-case orchestrators: one per CLI command.
//!
//! # Architecture
//!
//! Every orchestrator follows the same lifecycle:
//!
//! ```text
//! validate input -> load run -> acquire lock -> re-read HEAD ->
//! invoke collaborators -> mutate aggregate -> persist -> release lock
//! ```
//!
//! The lock guard is RAII, so release happens on every exit path. The
//! HEAD re-read is skipped only under `force`. Orchestrators never
//! bypass the aggregate: all state changes flow through run methods and
//! therefore through the state machine's guards.
//!
//! # Modules
//!
//! - [`plan`] / [`bump`] / [`notes`] / [`approve`] / [`publish`] /
//!   [`retry`] / [`status`] / [`cancel`] - the orchestrators
//!
//! # Example
//!
//! ```ignore
//! use capstan::engine::{self, Deps};
//! use capstan::core::types::Actor;
//!
//! let deps = Deps::production(repo_root)?;
//! let input = engine::plan::PlanInput::for_actor(Actor::human("alice"));
//! let output = engine::plan::plan(&deps, input).await?;
//! println!("planned run {}", output.run_id);
//! ```

pub mod approve;
pub mod bump;
pub mod cancel;
pub mod notes;
pub mod plan;
pub mod publish;
pub mod retry;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::collab::{
    FileVersionWriter, GitInspector, HookPublisher, InspectorError, NotesError, NotesGenerator,
    Publisher, PublisherError, RepoInspector, TemplateNotesGenerator, VersionWriter, WriterError,
};
use crate::core::config::{ConfigError, RepoConfig, StepConfig};
use crate::core::errors::{RunError, StepError, ValidationError};
use crate::core::paths::StorePaths;
use crate::core::run::{ReleaseRun, StepPlan};
use crate::core::types::{Actor, CommitSha, RunId, RunState};
use crate::plugin::{AuditLog, PluginHost};
use crate::store::{LockError, LockGuard, ReleaseLockManager, RunStore, StoreError};

/// Errors surfaced by the orchestrators.
///
/// Collaborator and domain errors pass through unchanged (wrapped only
/// for type), so callers can match on the underlying kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input-layer validation failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A domain rule rejected the operation.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The repository lock is held or broken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Repository inspection failed.
    #[error(transparent)]
    Inspector(#[from] InspectorError),

    /// Version writing failed.
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// Notes generation failed.
    #[error(transparent)]
    Notes(#[from] NotesError),

    /// The publisher could not run a step at all.
    #[error(transparent)]
    Publisher(#[from] PublisherError),

    /// A publishing step failed.
    #[error(transparent)]
    Step(#[from] StepError),

    /// Configuration is unreadable or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An active run already owns this repository.
    #[error("an active run already exists: {run_id} ({state}); use --force to plan anyway")]
    ActiveRunExists {
        /// The active run's id.
        run_id: RunId,
        /// Its current state.
        state: RunState,
    },
}

/// Dependencies shared by every orchestrator.
pub struct Deps {
    /// Repository root.
    pub repo_root: PathBuf,
    /// Run persistence.
    pub store: Arc<RunStore>,
    /// Advisory lock manager.
    pub locks: ReleaseLockManager,
    /// Repository inspection.
    pub inspector: Arc<dyn RepoInspector>,
    /// Version writing.
    pub version_writer: Arc<dyn VersionWriter>,
    /// Notes generation.
    pub notes: Arc<dyn NotesGenerator>,
    /// Step publishing.
    pub publisher: Arc<dyn Publisher>,
    /// Plugin host.
    pub plugins: Arc<PluginHost>,
    /// Repository configuration.
    pub config: RepoConfig,
}

impl Deps {
    /// Build the production dependency graph for a repository.
    pub fn production(repo_root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let repo_root = repo_root.into();
        let paths = StorePaths::new(&repo_root);
        let config = RepoConfig::load(&paths)?;

        let audit = Arc::new(AuditLog::new(paths.audit_log_path()));
        let plugins = Arc::new(PluginHost::from_config(&repo_root, &config, audit));
        let inspector: Arc<dyn RepoInspector> = Arc::new(GitInspector::new(&repo_root));
        let publisher: Arc<dyn Publisher> =
            Arc::new(HookPublisher::new(inspector.clone(), plugins.clone()));

        Ok(Self {
            store: Arc::new(RunStore::new()),
            locks: ReleaseLockManager::new(),
            inspector,
            version_writer: Arc::new(FileVersionWriter::new(&repo_root)),
            notes: Arc::new(TemplateNotesGenerator::new()),
            publisher,
            plugins,
            config,
            repo_root,
        })
    }

    /// Path routing for this repository.
    pub fn paths(&self) -> StorePaths {
        StorePaths::new(&self.repo_root)
    }
}

/// Reject an empty actor id.
pub(crate) fn validate_actor(actor: &Actor) -> Result<(), ValidationError> {
    if actor.id.trim().is_empty() {
        return Err(ValidationError::new("actor.id", "must not be empty"));
    }
    Ok(())
}

/// Load a run by explicit id or the `latest` pointer.
pub(crate) fn load_run(deps: &Deps, run_id: Option<&RunId>) -> Result<ReleaseRun, EngineError> {
    let run = match run_id {
        Some(run_id) => deps.store.load_from_repo(&deps.repo_root, run_id)?,
        None => deps.store.load_latest(&deps.repo_root)?,
    };
    Ok(run)
}

/// Acquire the repository lock for a run.
pub(crate) fn acquire_lock(deps: &Deps, run_id: &RunId) -> Result<LockGuard, EngineError> {
    Ok(deps.locks.acquire(&deps.paths(), run_id)?)
}

/// Re-read the working tree's HEAD unless `force` skips drift checks.
pub(crate) async fn current_head(
    deps: &Deps,
    force: bool,
) -> Result<Option<CommitSha>, EngineError> {
    if force {
        return Ok(None);
    }
    Ok(Some(deps.inspector.head_sha().await?))
}

/// Materialize the configured step plans for a run.
///
/// With no configured steps, a single `tag` step is planned. Idempotency
/// keys are derived from the step name and the run's tag (falling back
/// to the plan hash), so retries and external checks see stable keys.
pub(crate) fn materialize_steps(config: &RepoConfig, run: &ReleaseRun) -> Vec<StepPlan> {
    let suffix = run
        .tag_name
        .clone()
        .unwrap_or_else(|| run.plan_hash.chars().take(12).collect());

    let configured: Vec<StepConfig> = if config.steps.is_empty() {
        vec![StepConfig {
            name: "tag".into(),
            step_type: "tag".into(),
            plugin: None,
            hook: None,
            unsafe_step: false,
        }]
    } else {
        config.steps.clone()
    };

    configured
        .into_iter()
        .map(|step| {
            let config_hash = {
                use sha2::Digest;
                let mut hasher = sha2::Sha256::new();
                hasher.update(toml::to_string(&step).unwrap_or_default().as_bytes());
                hex::encode(hasher.finalize())
            };
            StepPlan {
                idempotency_key: format!("{}-{suffix}", step.name),
                name: step.name,
                step_type: step.step_type,
                config_hash,
                plugin_name: step.plugin,
                hook: step.hook,
                unsafe_step: step.unsafe_step,
            }
        })
        .collect()
}

/// A simple structural risk assessment over the commit window.
///
/// Conventional-commit analysis and richer scoring arrive via the
/// changeset collaborator; this baseline keeps risk meaningful when
/// planning stands alone.
pub(crate) fn materialize_risk(run: &ReleaseRun, working_tree_clean: bool) -> (f64, Vec<String>) {
    let mut score: f64 = 0.05;
    let mut reasons = Vec::new();

    let count = run.commits.len();
    if count > 0 {
        reasons.push(format!(
            "{count} commit{} in the release window",
            if count == 1 { "" } else { "s" }
        ));
        score += (count as f64 * 0.02).min(0.4);
    }
    if !working_tree_clean {
        reasons.push("working tree has uncommitted changes".into());
        score += 0.2;
    }
    if run.version_current.as_ref().map(|v| v.as_semver().major) == Some(0) {
        reasons.push("pre-1.0 version line".into());
        score += 0.05;
    }

    (score.min(1.0), reasons)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::NewRunParams;

    fn run_for(root: &std::path::Path) -> ReleaseRun {
        ReleaseRun::new(NewRunParams {
            repo_id: "org/app".into(),
            repo_root: root.to_path_buf(),
            base_ref: "v1.0.0".into(),
            head_sha: testutil::sha('a'),
            commits: vec![],
            config_hash: "cfg".into(),
            plugin_plan_hash: "plg".into(),
            actor: Actor::human("alice"),
            thresholds: Default::default(),
        })
    }

    #[test]
    fn empty_actor_id_rejected() {
        let err = validate_actor(&Actor::human("")).unwrap_err();
        assert_eq!(err.field, "actor.id");
        assert!(validate_actor(&Actor::human("  ")).is_err());
        assert!(validate_actor(&Actor::human("alice")).is_ok());
    }

    #[test]
    fn materialize_defaults_to_tag_step() {
        let fixture = testutil::mock_deps();
        let run = run_for(&fixture.deps.repo_root);
        let steps = materialize_steps(&RepoConfig::default(), &run);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, "tag");
        assert!(steps[0].idempotency_key.starts_with("tag-"));
    }

    #[test]
    fn materialize_uses_tag_in_idempotency_key() {
        let fixture = testutil::mock_deps();
        let mut run = run_for(&fixture.deps.repo_root);
        run.tag_name = Some("v1.1.0".into());
        let steps = materialize_steps(&RepoConfig::default(), &run);
        assert_eq!(steps[0].idempotency_key, "tag-v1.1.0");
    }
}
