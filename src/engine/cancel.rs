//! engine::cancel
//!
//! The Cancel orchestrator: abandon a run from any non-terminal state
//! except `publishing`.

use serde::Serialize;

use super::{acquire_lock, load_run, validate_actor, Deps, EngineError};
use crate::core::types::{Actor, RunId, RunState};

/// Input to the Cancel orchestrator.
#[derive(Debug, Clone)]
pub struct CancelInput {
    /// Who is cancelling.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Why the run is being abandoned.
    pub reason: String,
}

/// Output of the Cancel orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Its state afterwards (always `cancelled`).
    pub state: RunState,
}

/// Cancel a run.
pub async fn cancel(deps: &Deps, input: CancelInput) -> Result<CancelOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;
    let _lock = acquire_lock(deps, &run.id)?;

    run.cancel(input.reason.clone(), &input.actor)?;
    deps.store.save(&mut run)?;

    Ok(CancelOutput {
        run_id: run.id.clone(),
        state: run.state,
    })
}
