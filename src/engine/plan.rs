//! engine::plan
//!
//! The Plan orchestrator: create a new release run from the working
//! tree's current state.
//!
//! # Behavior
//!
//! - Rejects when an active run exists, unless `force`
//! - Rejects duplicate plans (same plan hash as an existing run)
//! - Resolves the commit window from the latest version tag (or a
//!   caller-supplied base ref) up to HEAD
//! - Records a version proposal: caller-supplied, or a patch bump over
//!   the latest released version
//! - Tag-push mode: an explicit tag plus version skips the bump step and
//!   lands the run directly in `versioned`
//! - Writes the state-machine export once, alongside the first snapshot

use serde::Serialize;

use super::{acquire_lock, materialize_risk, validate_actor, Deps, EngineError};
use crate::core::machine::GuardContext;
use crate::core::run::{NewRunParams, ReleaseRun};
use crate::core::types::{Actor, RunId, RunState};
use crate::core::version::{BumpKind, Version};
use crate::collab::git_inspector::repo_id_from;
use crate::core::errors::RunError;

/// A caller-supplied version proposal.
#[derive(Debug, Clone)]
pub struct VersionProposal {
    /// The version currently released.
    pub current: Version,
    /// The proposed next version.
    pub next: Version,
    /// How `next` was derived.
    pub bump_kind: BumpKind,
    /// Confidence in the proposal, `[0, 1]`.
    pub confidence: f64,
}

/// Input to the Plan orchestrator.
#[derive(Debug, Clone)]
pub struct PlanInput {
    /// Who is planning.
    pub actor: Actor,
    /// Base of the commit window; defaults to the latest version tag.
    pub base_ref: Option<String>,
    /// Pre-computed version proposal (e.g. from a changeset analyzer).
    pub proposal: Option<VersionProposal>,
    /// External changeset identity, when planning consumed one.
    pub changeset_id: Option<String>,
    /// Tag-push mode: the explicit tag to release.
    pub tag_name: Option<String>,
    /// Tag-push mode: the explicit version to release.
    pub version: Option<Version>,
    /// Bypass the active-run and head-drift checks.
    pub force: bool,
}

impl PlanInput {
    /// A plain plan by an actor, everything else defaulted.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            base_ref: None,
            proposal: None,
            changeset_id: None,
            tag_name: None,
            version: None,
            force: false,
        }
    }
}

/// Output of the Plan orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutput {
    /// The new run's id.
    pub run_id: RunId,
    /// Its plan hash.
    pub plan_hash: String,
    /// Its state after planning (`planned`, or `versioned` in tag-push
    /// mode).
    pub state: RunState,
    /// Number of commits in the window.
    pub commit_count: usize,
    /// The proposed next version, if any.
    pub version_next: Option<String>,
    /// Assessed risk.
    pub risk_score: f64,
}

/// Create and persist a new release run.
pub async fn plan(deps: &Deps, input: PlanInput) -> Result<PlanOutput, EngineError> {
    validate_actor(&input.actor)?;

    // One active run per repository.
    if !input.force {
        if let Some(active) = deps.store.find_active(&deps.repo_root)?.into_iter().next() {
            return Err(EngineError::ActiveRunExists {
                run_id: active.id,
                state: active.state,
            });
        }
    }

    let head = deps.inspector.head_sha().await?;
    let remote_url = deps.inspector.remote_url().await?;
    let repo_id = deps
        .config
        .repo_id
        .clone()
        .unwrap_or_else(|| repo_id_from(remote_url.as_deref(), &deps.repo_root));

    let prefix = deps.config.tag_prefix();
    let latest_tag = deps.inspector.latest_version_tag(prefix).await?;
    let base_ref = input
        .base_ref
        .clone()
        .or_else(|| latest_tag.as_ref().map(|(name, _)| name.clone()))
        .unwrap_or_default();

    let commits = deps.inspector.resolve_commits(&base_ref, &head).await?;
    if commits.is_empty() && !input.force {
        return Err(EngineError::Run(RunError::NoChanges));
    }

    let config_hash = deps.config.config_hash();
    let plugin_plan_hash = deps.config.plugin_plan_hash();

    let mut run = ReleaseRun::new(NewRunParams {
        repo_id,
        repo_root: deps.repo_root.clone(),
        base_ref,
        head_sha: head.clone(),
        commits,
        config_hash,
        plugin_plan_hash,
        actor: input.actor.clone(),
        thresholds: deps.config.risk_thresholds(),
    });
    run.changeset_id = input.changeset_id.clone();
    run.approval_policy = deps
        .config
        .approval
        .as_ref()
        .and_then(|approval| approval.to_policy());

    // Duplicate detection: same immutable inputs as an existing run.
    if let Some(existing) = deps
        .store
        .find_by_plan_hash(&deps.repo_root, &run.plan_hash)?
    {
        return Err(EngineError::Run(RunError::DuplicateRun {
            plan_hash: run.plan_hash.clone(),
            existing_run_id: existing.id.to_string(),
        }));
    }

    let _lock = acquire_lock(deps, &run.id)?;

    let current_version = latest_tag
        .as_ref()
        .map(|(_, version)| version.clone())
        .unwrap_or_else(Version::zero);

    let proposal = input.proposal.clone().unwrap_or_else(|| VersionProposal {
        next: BumpKind::Patch.apply(&current_version),
        current: current_version.clone(),
        bump_kind: BumpKind::Patch,
        confidence: 0.5,
    });
    run.set_version_proposal(
        proposal.current,
        proposal.next,
        proposal.bump_kind,
        proposal.confidence,
    )?;

    let (risk, reasons) = materialize_risk(&run, deps.inspector.is_clean().await?);
    run.set_risk(risk, reasons);

    let ctx = GuardContext {
        current_head: Some(&head),
        force: input.force,
    };
    run.plan(&input.actor, &ctx)?;

    // Tag-push mode: the caller already knows the exact tag and version.
    if let (Some(tag), Some(version)) = (&input.tag_name, &input.version) {
        run.record_tag_push_mode(tag, version);
        run.set_version(version.clone(), Some(tag.clone()))?;
        run.bump(&input.actor, &ctx)?;
    }

    deps.store.write_machine_export(&run)?;
    deps.store.save(&mut run)?;
    deps.store.set_latest(&deps.repo_root, &run.id)?;

    Ok(PlanOutput {
        run_id: run.id.clone(),
        plan_hash: run.plan_hash.clone(),
        state: run.state,
        commit_count: run.commits.len(),
        version_next: run.version_next.as_ref().map(|v| v.to_string()),
        risk_score: run.risk_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::mock_deps;

    fn alice() -> Actor {
        Actor::human("alice")
    }

    #[tokio::test]
    async fn plans_a_new_run() {
        let fixture = mock_deps();
        fixture
            .inspector
            .set_latest_tag("v1.0.0", Version::parse("1.0.0").unwrap());

        let output = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        assert_eq!(output.state, RunState::Planned);
        assert_eq!(output.commit_count, 2);
        assert_eq!(output.version_next.as_deref(), Some("1.0.1"));

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        assert_eq!(run.id, output.run_id);
        assert_eq!(run.base_ref, "v1.0.0");
    }

    #[tokio::test]
    async fn empty_actor_rejected() {
        let fixture = mock_deps();
        let err = plan(&fixture.deps, PlanInput::for_actor(Actor::human("")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_second_active_run() {
        let fixture = mock_deps();
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();

        let err = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ActiveRunExists { .. }));
    }

    #[tokio::test]
    async fn no_changes_rejected() {
        let fixture = mock_deps();
        fixture.inspector.set_commits(vec![]);
        let err = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Run(RunError::NoChanges)
        ));
    }

    #[tokio::test]
    async fn caller_proposal_wins() {
        let fixture = mock_deps();
        let mut input = PlanInput::for_actor(alice());
        input.proposal = Some(VersionProposal {
            current: Version::parse("1.0.0").unwrap(),
            next: Version::parse("2.0.0").unwrap(),
            bump_kind: BumpKind::Major,
            confidence: 0.95,
        });
        let output = plan(&fixture.deps, input).await.unwrap();
        assert_eq!(output.version_next.as_deref(), Some("2.0.0"));
    }

    #[tokio::test]
    async fn tag_push_mode_lands_versioned() {
        let fixture = mock_deps();
        let mut input = PlanInput::for_actor(alice());
        input.tag_name = Some("v3.0.0".into());
        input.version = Some(Version::parse("3.0.0").unwrap());

        let output = plan(&fixture.deps, input).await.unwrap();
        assert_eq!(output.state, RunState::Versioned);

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        assert_eq!(run.tag_name.as_deref(), Some("v3.0.0"));

        // The tag-push event made it into the journal.
        let events = fixture
            .deps
            .store
            .journal()
            .load_events(&fixture.deps.paths(), &run.id)
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_name == "run.tag_push_mode_detected"));
    }

    #[tokio::test]
    async fn machine_export_written_at_plan_time() {
        let fixture = mock_deps();
        let output = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        let path = fixture.deps.paths().run_machine_path(&output.run_id);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn duplicate_plan_hash_rejected_even_after_cancel() {
        let fixture = mock_deps();
        let first = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();

        // Cancel the first run so it is no longer active, then re-plan
        // the identical inputs.
        let mut run = fixture
            .deps
            .store
            .load_from_repo(&fixture.deps.repo_root, &first.run_id)
            .unwrap();
        run.cancel("test".into(), &alice()).unwrap();
        fixture.deps.store.save(&mut run).unwrap();

        let err = plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Run(RunError::DuplicateRun { .. })
        ));
    }
}
