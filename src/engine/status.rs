//! engine::status
//!
//! The Status orchestrator: a read-only view of a run.
//!
//! Status never takes the repository lock; readers tolerate observing
//! the pre- or post-state of a concurrent writer.

use serde::Serialize;

use super::{load_run, Deps, EngineError};
use crate::core::types::{RunId, RunState, UtcTimestamp};

/// A run is reported stale when untouched for this long.
const STALE_AFTER_SECS: i64 = 3600;

/// Input to the Status orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StatusInput {
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
}

/// HEAD drift details.
#[derive(Debug, Clone, Serialize)]
pub struct HeadDrift {
    /// The head recorded at plan time.
    pub expected: String,
    /// The working tree's current head.
    pub actual: String,
}

/// Output of the Status orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Current workflow state.
    pub state: RunState,
    /// Current plan hash.
    pub plan_hash: String,
    /// Assessed risk.
    pub risk_score: f64,
    /// Decided next version, if any.
    pub version_next: Option<String>,
    /// Tag to be created, if decided.
    pub tag_name: Option<String>,
    /// The CLI command that makes progress from here, if any.
    pub next_action: Option<String>,
    /// Untouched for over an hour and not terminal.
    pub stale: bool,
    /// HEAD drift warning, when the working tree moved.
    pub head_drift: Option<HeadDrift>,
    /// Last failure message, if any.
    pub last_error: Option<String>,
    /// Whether the repository lock is currently held.
    pub locked: bool,
}

/// The suggested next command for a state.
fn next_action(state: RunState) -> Option<&'static str> {
    match state {
        RunState::Draft => Some("capstan plan"),
        RunState::Planned => Some("capstan bump"),
        RunState::Versioned => Some("capstan notes"),
        RunState::NotesReady => Some("capstan approve"),
        RunState::Approved => Some("capstan publish"),
        RunState::Publishing => Some("capstan publish"),
        RunState::Failed => Some("capstan retry"),
        RunState::Published | RunState::Cancelled => None,
    }
}

/// Compute the status view for a run.
pub async fn status(deps: &Deps, input: StatusInput) -> Result<StatusOutput, EngineError> {
    let run = load_run(deps, input.run_id.as_ref())?;

    let head_drift = match deps.inspector.head_sha().await {
        Ok(head) if head != run.head_sha => Some(HeadDrift {
            expected: run.head_sha.to_string(),
            actual: head.to_string(),
        }),
        _ => None,
    };

    let age = run.updated_at.seconds_until(&UtcTimestamp::now());
    let stale = !run.state.is_terminal() && age > STALE_AFTER_SECS;

    Ok(StatusOutput {
        run_id: run.id.clone(),
        state: run.state,
        plan_hash: run.plan_hash.clone(),
        risk_score: run.risk_score,
        version_next: run.version_next.as_ref().map(|v| v.to_string()),
        tag_name: run.tag_name.clone(),
        next_action: next_action(run.state).map(str::to_string),
        stale,
        head_drift,
        last_error: run.last_error.clone(),
        locked: deps.locks.is_locked(&deps.paths()),
    })
}
