//! engine::retry
//!
//! The Retry orchestrator: reset failed steps and re-enter the publish
//! loop.

use super::publish::{run_step_loop, PublishOutput};
use super::{acquire_lock, load_run, validate_actor, Deps, EngineError};
use crate::core::types::{Actor, RunId};

/// Input to the Retry orchestrator.
#[derive(Debug, Clone)]
pub struct RetryInput {
    /// Who is retrying.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Dry run: mark remaining steps skipped instead of executing.
    pub dry_run: bool,
}

impl RetryInput {
    /// A plain retry by an actor.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            run_id: None,
            dry_run: false,
        }
    }
}

/// Retry a failed publish.
///
/// Failed steps return to pending with their attempt counts preserved,
/// the run transitions back to `publishing`, and the step loop resumes.
pub async fn retry(deps: &Deps, input: RetryInput) -> Result<PublishOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;
    let _lock = acquire_lock(deps, &run.id)?;

    run.retry_publish(&input.actor)?;
    deps.store.save(&mut run)?;

    run_step_loop(deps, run, &input.actor, input.dry_run).await
}
