//! engine::approve
//!
//! The Approve orchestrator: single and multi-level approval.
//!
//! # Policy
//!
//! - Auto-approval is rejected when risk reaches the auto-approve
//!   threshold; any approval is rejected at the block threshold
//! - Under a multi-level policy, `level` records one grant; the APPROVE
//!   transition fires when every mandatory level is granted (via
//!   `complete`, or implicitly when the final grant lands)

use serde::Serialize;

use super::{acquire_lock, current_head, load_run, validate_actor, Deps, EngineError};
use crate::core::machine::GuardContext;
use crate::core::types::{Actor, RunId, RunState};

/// Input to the Approve orchestrator.
#[derive(Debug, Clone)]
pub struct ApproveInput {
    /// Who is approving.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Auto-approval (policy decides, no human in the loop).
    pub auto: bool,
    /// Record a grant at this policy level instead of a plain approval.
    pub level: Option<u32>,
    /// Justification recorded with a level grant.
    pub justification: Option<String>,
    /// Bypass the head-drift check.
    pub force: bool,
}

impl ApproveInput {
    /// A plain (single-level, human) approval.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            run_id: None,
            auto: false,
            level: None,
            justification: None,
            force: false,
        }
    }
}

/// Output of the Approve orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ApproveOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Its state afterwards (`approved`, or still `notes_ready` when
    /// more grants are required).
    pub state: RunState,
    /// Whether the approval was automatic.
    pub auto_approved: bool,
    /// Levels still missing under a multi-level policy.
    pub pending_levels: Vec<u32>,
}

/// Approve a run for publishing.
pub async fn approve(deps: &Deps, input: ApproveInput) -> Result<ApproveOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;
    let _lock = acquire_lock(deps, &run.id)?;

    let head = current_head(deps, input.force).await?;
    let ctx = GuardContext {
        current_head: head.as_ref(),
        force: input.force,
    };

    match input.level {
        Some(level) => {
            run.approve_at_level(level, &input.actor, input.justification.clone())?;
            // Complete the approval as soon as the policy is satisfied.
            if run.validate_approval_policy().is_ok() {
                run.complete_multi_level_approval(&input.actor, &ctx)?;
            }
        }
        None => {
            run.approve(&input.actor, input.auto, &ctx)?;
        }
    }

    deps.store.save(&mut run)?;

    let pending_levels = match (&run.approval_policy, run.state) {
        (Some(policy), RunState::NotesReady) => policy
            .mandatory_levels()
            .into_iter()
            .filter(|l| !run.level_grants.contains_key(l))
            .collect(),
        _ => Vec::new(),
    };

    Ok(ApproveOutput {
        run_id: run.id.clone(),
        state: run.state,
        auto_approved: run.approval.as_ref().map(|a| a.auto_approved).unwrap_or(false),
        pending_levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ApprovalConfig, ApprovalLevelConfig, RepoConfig};
    use crate::core::errors::RunError;
    use crate::engine::bump::{bump, BumpInput};
    use crate::engine::notes::{generate_notes, NotesInput};
    use crate::engine::plan::{plan, PlanInput};
    use crate::engine::testutil::{mock_deps, mock_deps_with_config, MockDeps};

    fn alice() -> Actor {
        Actor::human("alice")
    }

    async fn notes_ready(fixture: &MockDeps) {
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        bump(&fixture.deps, BumpInput::for_actor(alice()))
            .await
            .unwrap();
        generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approves_notes_ready_run() {
        let fixture = mock_deps();
        notes_ready(&fixture).await;

        let output = approve(&fixture.deps, ApproveInput::for_actor(alice()))
            .await
            .unwrap();
        assert_eq!(output.state, RunState::Approved);
        assert!(!output.auto_approved);

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        let approval = run.approval.unwrap();
        assert_eq!(approval.approved_by, "alice");
        assert_eq!(approval.plan_hash, run.plan_hash);
    }

    #[tokio::test]
    async fn auto_approve_honors_threshold() {
        let fixture = mock_deps();
        notes_ready(&fixture).await;

        // Push risk over the auto threshold.
        let mut run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        run.set_risk(0.5, vec!["risky".into()]);
        fixture.deps.store.save(&mut run).unwrap();

        let mut input = ApproveInput::for_actor(Actor::ci("pipeline"));
        input.auto = true;
        let err = approve(&fixture.deps, input).await.unwrap_err();
        assert!(matches!(err, EngineError::Run(RunError::RiskTooHigh { .. })));
    }

    #[tokio::test]
    async fn multi_level_flow() {
        let config: RepoConfig = RepoConfig {
            approval: Some(ApprovalConfig {
                sequential: true,
                levels: vec![
                    ApprovalLevelConfig {
                        level: 1,
                        name: "engineering".into(),
                        mandatory: true,
                    },
                    ApprovalLevelConfig {
                        level: 2,
                        name: "release-manager".into(),
                        mandatory: true,
                    },
                ],
            }),
            ..Default::default()
        };
        let fixture = mock_deps_with_config(config);
        notes_ready(&fixture).await;

        let mut first = ApproveInput::for_actor(alice());
        first.level = Some(1);
        let output = approve(&fixture.deps, first).await.unwrap();
        assert_eq!(output.state, RunState::NotesReady);
        assert_eq!(output.pending_levels, vec![2]);

        let mut second = ApproveInput::for_actor(Actor::human("rm"));
        second.level = Some(2);
        second.justification = Some("ship it".into());
        let output = approve(&fixture.deps, second).await.unwrap();
        assert_eq!(output.state, RunState::Approved);
        assert!(output.pending_levels.is_empty());
    }

    #[tokio::test]
    async fn plain_approve_blocked_by_unsatisfied_policy() {
        let config = RepoConfig {
            approval: Some(ApprovalConfig {
                sequential: false,
                levels: vec![ApprovalLevelConfig {
                    level: 1,
                    name: "engineering".into(),
                    mandatory: true,
                }],
            }),
            ..Default::default()
        };
        let fixture = mock_deps_with_config(config);
        notes_ready(&fixture).await;

        let err = approve(&fixture.deps, ApproveInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Run(RunError::ApprovalIncomplete { .. })
        ));
    }
}
