//! engine::publish
//!
//! The Publish orchestrator: drive the execution plan step by step.
//!
//! # Behavior
//!
//! Accepted from `approved` (fresh start), `publishing` (resume after a
//! crash), and `published` (idempotent, returns immediately). Per step:
//!
//! 1. Ask the publisher's idempotency check; already-applied steps are
//!    skipped without counting an attempt
//! 2. Mark the step started
//! 3. Dry runs mark the step skipped with output `dry run`
//! 4. Execute under the step timeout
//! 5. On success, persist immediately so a crash resumes at the next step
//! 6. On failure, persist and return; `capstan retry` picks it up
//!
//! `pre_publish` hooks fire when publishing starts, `post_publish` after
//! the run reaches `published`. Hook failures are recorded, never fatal.

use std::time::Duration;

use serde::Serialize;

use super::{
    acquire_lock, current_head, load_run, materialize_steps, validate_actor, Deps, EngineError,
};
use crate::collab::StepOutcome;
use crate::core::errors::StepError;
use crate::core::machine::GuardContext;
use crate::core::run::ReleaseRun;
use crate::core::types::{Actor, RunId, RunState};
use crate::plugin::ReleaseContext;

/// Hard ceiling on one step's execution.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Input to the Publish orchestrator.
#[derive(Debug, Clone)]
pub struct PublishInput {
    /// Who is publishing.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Dry run: mark every step skipped, touch nothing external.
    pub dry_run: bool,
    /// Bypass the head-drift check.
    pub force: bool,
}

impl PublishInput {
    /// A plain publish by an actor.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            run_id: None,
            dry_run: false,
            force: false,
        }
    }
}

/// Per-step report in the output.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Final per-step state.
    pub state: String,
    /// Attempts made.
    pub attempts: u32,
    /// Captured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure message, if the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the Publish orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Its state afterwards.
    pub state: RunState,
    /// The run was already published before this invocation.
    pub already_published: bool,
    /// Per-step results, in plan order.
    pub steps: Vec<StepReport>,
}

fn step_reports(run: &ReleaseRun) -> Vec<StepReport> {
    run.steps
        .iter()
        .filter_map(|step| {
            run.step_status.get(&step.name).map(|status| StepReport {
                name: step.name.clone(),
                state: status.state.to_string(),
                attempts: status.attempts,
                output: status.output.clone(),
                error: status.last_error.clone(),
            })
        })
        .collect()
}

/// Publish a run: execute its steps and transition to `published`.
pub async fn publish(deps: &Deps, input: PublishInput) -> Result<PublishOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;

    // Idempotent: publishing a published run is a no-op success.
    if run.state == RunState::Published {
        return Ok(PublishOutput {
            run_id: run.id.clone(),
            state: run.state,
            already_published: true,
            steps: step_reports(&run),
        });
    }

    let _lock = acquire_lock(deps, &run.id)?;

    if run.state == RunState::Approved {
        let head = current_head(deps, input.force).await?;
        let ctx = GuardContext {
            current_head: head.as_ref(),
            force: input.force,
        };

        if run.steps.is_empty() {
            run.set_execution_plan(materialize_steps(&deps.config, &run))?;
        }
        run.start_publishing(&input.actor, &ctx)?;
        deps.store.save(&mut run)?;

        dispatch_hooks(deps, &mut run, "pre_publish", input.dry_run).await;
        deps.store.save(&mut run)?;
    } else if run.state != RunState::Publishing {
        // Produce the machine's typed rejection (with CLI guidance) for
        // any other state.
        run.start_publishing(&input.actor, &GuardContext::default())?;
    }

    run_step_loop(deps, run, &input.actor, input.dry_run).await
}

/// Execute pending steps until done, failed, or exhausted.
///
/// Callers must hold the repository lock.
pub(crate) async fn run_step_loop(
    deps: &Deps,
    mut run: ReleaseRun,
    actor: &Actor,
    dry_run: bool,
) -> Result<PublishOutput, EngineError> {
    while let Some(step) = run.next_pending_step().cloned() {
        if deps.publisher.check_idempotency(&run, &step).await? {
            run.mark_step_skipped(
                &step.name,
                Some("already applied externally".into()),
                actor,
            )?;
            deps.store.save(&mut run)?;
            continue;
        }

        run.mark_step_started(&step.name)?;

        if dry_run {
            run.mark_step_skipped(&step.name, Some("dry run".into()), actor)?;
            deps.store.save(&mut run)?;
            continue;
        }

        let outcome = match tokio::time::timeout(
            STEP_TIMEOUT,
            deps.publisher.execute_step(&run, &step),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => StepOutcome::failed(e.to_string()),
            Err(_) => StepOutcome::failed(format!(
                "step timed out after {}s",
                STEP_TIMEOUT.as_secs()
            )),
        };

        if outcome.already_done {
            run.mark_step_skipped(&step.name, Some(outcome.output), actor)?;
            deps.store.save(&mut run)?;
            continue;
        }

        if outcome.success {
            run.mark_step_done(&step.name, Some(outcome.output), actor)?;
            // Persist before the next step so a crash resumes here.
            deps.store.save(&mut run)?;
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| format!("step '{}' failed", step.name));
            run.mark_step_failed(&step.name, error.clone(), actor)?;
            deps.store.save(&mut run)?;

            let attempts = run
                .step_status
                .get(&step.name)
                .map(|s| s.attempts)
                .unwrap_or(0);
            return Err(EngineError::Step(StepError {
                step_name: step.name.clone(),
                step_type: step.step_type.clone(),
                attempts,
                last_error: error,
            }));
        }
    }

    run.mark_published(actor)?;
    deps.store.save(&mut run)?;

    dispatch_hooks(deps, &mut run, "post_publish", dry_run).await;
    deps.store.save(&mut run)?;

    Ok(PublishOutput {
        run_id: run.id.clone(),
        state: run.state,
        already_published: false,
        steps: step_reports(&run),
    })
}

/// Fan a lifecycle hook out to the plugin host and record the results.
async fn dispatch_hooks(deps: &Deps, run: &mut ReleaseRun, hook: &str, dry_run: bool) {
    let context = ReleaseContext::from_run(run);
    let responses = deps.plugins.execute_hook(hook, &context, dry_run).await;
    for response in responses {
        if !response.success {
            tracing::warn!(
                plugin = %response.plugin,
                hook,
                error = response.error.as_deref().unwrap_or(""),
                "plugin hook failed"
            );
        }
        run.record_plugin_execution(
            &response.plugin,
            hook,
            response.success,
            response.duration_ms,
            response.error.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RunError;
    use crate::core::run::StepState;
    use crate::engine::approve::{approve, ApproveInput};
    use crate::engine::bump::{bump, BumpInput};
    use crate::engine::notes::{generate_notes, NotesInput};
    use crate::engine::plan::{plan, PlanInput};
    use crate::engine::testutil::{mock_deps, MockDeps};

    fn alice() -> Actor {
        Actor::human("alice")
    }

    async fn approved(fixture: &MockDeps) {
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        bump(&fixture.deps, BumpInput::for_actor(alice()))
            .await
            .unwrap();
        generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
        approve(&fixture.deps, ApproveInput::for_actor(alice()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn happy_path_publishes() {
        let fixture = mock_deps();
        approved(&fixture).await;

        let output = publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap();
        assert_eq!(output.state, RunState::Published);
        assert!(!output.already_published);
        assert_eq!(output.steps.len(), 1);
        assert_eq!(output.steps[0].state, "done");
        assert_eq!(output.steps[0].attempts, 1);
        assert_eq!(fixture.publisher.executed(), vec!["tag"]);

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        assert!(run.published_at.is_some());
        assert_eq!(run.history.len(), 6);
    }

    #[tokio::test]
    async fn republish_is_idempotent() {
        let fixture = mock_deps();
        approved(&fixture).await;
        publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap();

        let output = publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap();
        assert!(output.already_published);
        // The publisher was not consulted again.
        assert_eq!(fixture.publisher.executed(), vec!["tag"]);
    }

    #[tokio::test]
    async fn idempotent_step_is_skipped_without_attempt() {
        let fixture = mock_deps();
        approved(&fixture).await;
        fixture.publisher.mark_already_done("tag");

        let output = publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap();
        assert_eq!(output.state, RunState::Published);
        assert_eq!(output.steps[0].state, "skipped");
        assert_eq!(output.steps[0].attempts, 0);
        assert!(output.steps[0].output.as_deref().unwrap().contains("already"));
        assert!(fixture.publisher.executed().is_empty());
    }

    #[tokio::test]
    async fn dry_run_skips_every_step() {
        let fixture = mock_deps();
        approved(&fixture).await;

        let mut input = PublishInput::for_actor(alice());
        input.dry_run = true;
        let output = publish(&fixture.deps, input).await.unwrap();
        assert_eq!(output.state, RunState::Published);
        assert_eq!(output.steps[0].state, "skipped");
        assert_eq!(output.steps[0].output.as_deref(), Some("dry run"));
        assert!(fixture.publisher.executed().is_empty());
    }

    #[tokio::test]
    async fn step_failure_persists_and_surfaces() {
        let fixture = mock_deps();
        approved(&fixture).await;
        fixture.publisher.fail_step("tag", "remote rejected");

        let err = publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap_err();
        match err {
            EngineError::Step(step) => {
                assert_eq!(step.step_name, "tag");
                assert_eq!(step.attempts, 1);
                assert!(step.last_error.contains("remote rejected"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.step_status["tag"].state, StepState::Failed);
    }

    #[tokio::test]
    async fn publish_from_notes_ready_gets_guidance() {
        let fixture = mock_deps();
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        bump(&fixture.deps, BumpInput::for_actor(alice()))
            .await
            .unwrap();
        generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();

        let err = publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap_err();
        match err {
            EngineError::Run(RunError::InvalidState { guidance, .. }) => {
                assert_eq!(guidance.as_deref(), Some("capstan approve"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn interrupted_publish_resumes_at_next_step() {
        use crate::core::config::{RepoConfig, StepConfig};

        let config = RepoConfig {
            steps: vec![
                StepConfig {
                    name: "tag".into(),
                    step_type: "tag".into(),
                    plugin: None,
                    hook: None,
                    unsafe_step: false,
                },
                StepConfig {
                    name: "announce".into(),
                    step_type: "tag".into(),
                    plugin: None,
                    hook: None,
                    unsafe_step: false,
                },
            ],
            ..Default::default()
        };
        let fixture = crate::engine::testutil::mock_deps_with_config(config);
        approved(&fixture).await;
        fixture.publisher.fail_step("announce", "flaky network");

        // First attempt: "tag" succeeds (persisted), "announce" fails.
        publish(&fixture.deps, PublishInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert_eq!(fixture.publisher.executed(), vec!["tag", "announce"]);

        // Retry path re-enters the loop; "tag" is not re-executed.
        fixture.publisher.clear_failure("announce");
        let output = crate::engine::retry::retry(
            &fixture.deps,
            crate::engine::retry::RetryInput::for_actor(alice()),
        )
        .await
        .unwrap();
        assert_eq!(output.state, RunState::Published);
        assert_eq!(
            fixture.publisher.executed(),
            vec!["tag", "announce", "announce"]
        );

        let run = fixture
            .deps
            .store
            .load_latest(&fixture.deps.repo_root)
            .unwrap();
        assert_eq!(run.step_status["tag"].attempts, 1);
        assert_eq!(run.step_status["announce"].attempts, 2);
    }
}
