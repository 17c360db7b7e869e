//! engine::notes
//!
//! The GenerateNotes orchestrator.
//!
//! # Caching
//!
//! The generator's `compute_inputs_hash` fingerprints everything it
//! would consume. When the run already carries notes with the same
//! fingerprint, the existing notes are reused without re-invoking the
//! generator.

use serde::Serialize;

use super::{acquire_lock, current_head, load_run, validate_actor, Deps, EngineError};
use crate::collab::NotesOptions;
use crate::core::machine::GuardContext;
use crate::core::run::ReleaseNotes;
use crate::core::types::{Actor, RunId, RunState};

/// Input to the GenerateNotes orchestrator.
#[derive(Debug, Clone)]
pub struct NotesInput {
    /// Who is generating.
    pub actor: Actor,
    /// Explicit run; defaults to the latest.
    pub run_id: Option<RunId>,
    /// Audience preset; defaults to the repo configuration.
    pub audience: Option<String>,
    /// Tone preset; defaults to the repo configuration.
    pub tone: Option<String>,
    /// Bypass the head-drift check.
    pub force: bool,
}

impl NotesInput {
    /// A plain generation by an actor.
    pub fn for_actor(actor: Actor) -> Self {
        Self {
            actor,
            run_id: None,
            audience: None,
            tone: None,
            force: false,
        }
    }
}

/// Output of the GenerateNotes orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct NotesOutput {
    /// The run's id.
    pub run_id: RunId,
    /// Its state after generation.
    pub state: RunState,
    /// The notes text.
    pub text: String,
    /// Whether cached notes were reused.
    pub cached: bool,
}

/// Generate (or reuse) release notes and advance to `notes_ready`.
pub async fn generate_notes(deps: &Deps, input: NotesInput) -> Result<NotesOutput, EngineError> {
    validate_actor(&input.actor)?;

    let mut run = load_run(deps, input.run_id.as_ref())?;
    let _lock = acquire_lock(deps, &run.id)?;

    let head = current_head(deps, input.force).await?;
    let ctx = GuardContext {
        current_head: head.as_ref(),
        force: input.force,
    };

    let defaults = deps.config.notes.clone().unwrap_or_default();
    let options = NotesOptions {
        audience: input.audience.clone().unwrap_or(defaults.audience),
        tone: input.tone.clone().unwrap_or(defaults.tone),
    };

    let inputs_hash = deps.notes.compute_inputs_hash(&run, &options);
    if run.state == RunState::NotesReady
        && run.notes_inputs_hash.as_deref() == Some(inputs_hash.as_str())
    {
        if let Some(notes) = &run.notes {
            return Ok(NotesOutput {
                run_id: run.id.clone(),
                state: run.state,
                text: notes.text.clone(),
                cached: true,
            });
        }
    }

    let generated = deps.notes.generate(&run, &options).await?;
    let notes = ReleaseNotes {
        text: generated.text.clone(),
        audience_preset: options.audience.clone(),
        tone_preset: options.tone.clone(),
        provider: generated.provider,
        model: generated.model,
        generated_at: generated.generated_at,
    };
    run.generate_notes(Some(notes), inputs_hash, &input.actor, &ctx)?;

    if let Some(version) = run.version_next.clone() {
        deps.version_writer
            .write_changelog(&version, &generated.text)
            .await?;
    }

    deps.store.save(&mut run)?;

    Ok(NotesOutput {
        run_id: run.id.clone(),
        state: run.state,
        text: generated.text,
        cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RunError;
    use crate::engine::bump::{bump, BumpInput};
    use crate::engine::plan::{plan, PlanInput};
    use crate::engine::testutil::mock_deps;

    fn alice() -> Actor {
        Actor::human("alice")
    }

    async fn versioned(fixture: &crate::engine::testutil::MockDeps) {
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();
        bump(&fixture.deps, BumpInput::for_actor(alice()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generates_and_persists_notes() {
        let fixture = mock_deps();
        versioned(&fixture).await;

        let output = generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
        assert_eq!(output.state, RunState::NotesReady);
        assert!(!output.cached);
        assert_eq!(output.text, "release 0.0.1");
        assert_eq!(fixture.notes.generate_calls(), 1);

        // Changelog written through the version writer.
        assert_eq!(fixture.version_writer.written_changelogs().len(), 1);
    }

    #[tokio::test]
    async fn second_invocation_hits_cache() {
        let fixture = mock_deps();
        versioned(&fixture).await;

        generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
        let output = generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
        assert!(output.cached);
        assert_eq!(fixture.notes.generate_calls(), 1);
    }

    #[tokio::test]
    async fn different_options_regenerate() {
        let fixture = mock_deps();
        versioned(&fixture).await;

        generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap();
        let mut input = NotesInput::for_actor(alice());
        input.tone = Some("detailed".into());
        let output = generate_notes(&fixture.deps, input).await.unwrap();
        assert!(!output.cached);
        assert_eq!(fixture.notes.generate_calls(), 2);
    }

    #[tokio::test]
    async fn requires_versioned_state() {
        let fixture = mock_deps();
        plan(&fixture.deps, PlanInput::for_actor(alice()))
            .await
            .unwrap();

        let err = generate_notes(&fixture.deps, NotesInput::for_actor(alice()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Run(RunError::InvalidState { .. })
        ));
    }
}
