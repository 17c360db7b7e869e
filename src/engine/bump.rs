//! engine::bump
//!
//! The Bump orchestrator: apply the version decision to the working
//! tree and advance the run to `versioned`.

use serde::Serialize;

use super::{acquire_lock, current_head, load_run, validate_actor, Deps, EngineError};
use crate::core::machine::GuardContext;
use crate::core::types::{Actor, RunId, RunState};
use crate::core::version::Version;

/// Input to the Bump orchestrator.
#[derive(Debug, Clone)]
pub struct BumpInput {
    /// Who is bumping.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Override the planned version proposal.
    pub version_override: Option<Version>,
    /// Override the tag name (defaults to prefix + version).
    pub tag_name: Option<String>,
    /// Bypass the head-drift check.
    pub force: bool,
}

impl BumpInput {
    /// A plain bump by an actor.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            run_id: None,
            version_override: None,
            tag_name: None,
            force: false,
        }
    }
}

/// Output of the Bump orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct BumpOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Its state after bumping.
    pub state: RunState,
    /// The decided version.
    pub version_next: String,
    /// The tag that will be created on publish.
    pub tag_name: String,
}

/// Apply the version decision: write manifests, transition to
/// `versioned`.
pub async fn bump(deps: &Deps, input: BumpInput) -> Result<BumpOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;
    let _lock = acquire_lock(deps, &run.id)?;

    let head = current_head(deps, input.force).await?;
    let ctx = GuardContext {
        current_head: head.as_ref(),
        force: input.force,
    };

    if let Some(version) = &input.version_override {
        let tag = input
            .tag_name
            .clone()
            .unwrap_or_else(|| version.tag_name(deps.config.tag_prefix()));
        run.set_version(version.clone(), Some(tag))?;
    } else if let (Some(version), None) = (run.version_next.clone(), run.tag_name.clone()) {
        // Pin the tag now so the version writer and the aggregate agree.
        run.set_version(
            version.clone(),
            Some(version.tag_name(deps.config.tag_prefix())),
        )?;
    }

    run.bump(&input.actor, &ctx)?;

    let version = run
        .version_next
        .clone()
        .expect("bump guard guarantees a version");
    deps.version_writer.write_version(&version).await?;

    deps.store.save(&mut run)?;

    Ok(BumpOutput {
        run_id: run.id.clone(),
        state: run.state,
        version_next: version.to_string(),
        tag_name: run.tag_name.clone().unwrap_or_default(),
    })
}
