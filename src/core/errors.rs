//! core::errors
//!
//! Typed domain errors for the release-run aggregate and state machine.
//!
//! # Design
//!
//! Every rejection carries structured context, never a bare string. The
//! store, lock, journal, and plugin layers define their own error enums;
//! this module owns the errors that originate in domain rules.
//!
//! [`RunError::InvalidState`] additionally carries `guidance`: the next CLI
//! command that would make progress from the current state, so callers can
//! print an actionable hint.

use thiserror::Error;

use super::types::{CommitSha, RunState};

/// Errors from release-run domain rules.
#[derive(Debug, Error)]
pub enum RunError {
    /// A transition was attempted from an incompatible state.
    #[error("cannot {action} from state '{current}'{}", guidance_suffix(.guidance))]
    InvalidState {
        /// The run's current state.
        current: RunState,
        /// The attempted action (event name).
        action: String,
        /// Suggested next CLI command, when one exists.
        guidance: Option<String>,
    },

    /// The working tree's HEAD no longer matches the run's recorded head.
    #[error("HEAD has changed since planning: expected {expected}, found {actual} (use --force to override)")]
    HeadShaChanged {
        /// The head recorded at plan time.
        expected: CommitSha,
        /// The working tree's current head.
        actual: CommitSha,
    },

    /// A version bump was requested before any version proposal was recorded.
    #[error("no version has been set for this run")]
    VersionNotSet,

    /// Notes were required but absent.
    #[error("release notes are missing")]
    NotesMissing,

    /// An approval was required but absent.
    #[error("run has not been approved")]
    NotApproved,

    /// The run already reached `published`.
    #[error("run is already published")]
    AlreadyPublished,

    /// The commit window is empty.
    #[error("no changes between base and head")]
    NoChanges,

    /// An approval exists but is bound to a different plan hash.
    #[error("approval is bound to plan hash {bound} but the current plan hash is {current}; re-approve before publishing")]
    ApprovalBoundToHash {
        /// The plan hash captured at approval time.
        bound: String,
        /// The run's current plan hash.
        current: String,
    },

    /// No step with the given name exists in the execution plan.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// A step that already completed cannot be started again.
    #[error("step already done: {0}")]
    StepAlreadyDone(String),

    /// The stored plan hash no longer matches the recomputed
    /// fingerprint of the run's inputs.
    #[error("plan hash mismatch: stored {stored}, computed {computed}; re-plan before continuing")]
    PlanHashMismatch {
        /// The hash recorded in the snapshot.
        stored: String,
        /// The hash recomputed from the run's inputs.
        computed: String,
    },

    /// Two runs share the same plan hash.
    #[error("a run with plan hash {plan_hash} already exists: {existing_run_id}")]
    DuplicateRun {
        /// The colliding plan hash.
        plan_hash: String,
        /// The run that already owns it.
        existing_run_id: String,
    },

    /// Cancellation is not allowed from this state.
    #[error("cannot cancel from state '{current}'{}", publishing_hint(.current))]
    CannotCancel {
        /// The run's current state.
        current: RunState,
    },

    /// Retry is only valid from `failed`.
    #[error("cannot retry from state '{current}'; retry requires a failed publish")]
    CannotRetry {
        /// The run's current state.
        current: RunState,
    },

    /// Risk score exceeds the configured limit for the attempted action.
    #[error("risk score {score:.2} exceeds threshold {threshold:.2}: {}", .reasons.join("; "))]
    RiskTooHigh {
        /// The run's risk score.
        score: f64,
        /// The threshold that was exceeded.
        threshold: f64,
        /// Ordered risk factors contributing to the score.
        reasons: Vec<String>,
    },

    /// A multi-level grant arrived out of order under a sequential policy.
    #[error("approval level {level} cannot be granted before level {missing}")]
    ApprovalLevelOutOfOrder {
        /// The level that was attempted.
        level: u32,
        /// The lower mandatory level still ungranted.
        missing: u32,
    },

    /// A grant referenced a level absent from the approval policy.
    #[error("approval level {0} is not defined by the policy")]
    ApprovalLevelUnknown(u32),

    /// Multi-level completion attempted with mandatory levels missing.
    #[error("mandatory approval levels not yet granted: {}", .missing.iter().map(u32::to_string).collect::<Vec<_>>().join(", "))]
    ApprovalIncomplete {
        /// Mandatory levels without a grant.
        missing: Vec<u32>,
    },
}

/// A typed failure from executing a single publishing step.
///
/// Wraps the publisher's failure with enough context to drive retry
/// decisions without re-reading the run.
#[derive(Debug, Clone, Error)]
#[error("step '{step_name}' ({step_type}) failed after {attempts} attempt(s): {last_error}")]
pub struct StepError {
    /// The step's name.
    pub step_name: String,
    /// The step's type.
    pub step_type: String,
    /// Attempts made so far, including the failing one.
    pub attempts: u32,
    /// The publisher's failure message.
    pub last_error: String,
}

/// An input-layer validation failure.
#[derive(Debug, Clone, Error)]
#[error("invalid input: {field}: {message}")]
pub struct ValidationError {
    /// The offending field, dotted-path form (e.g. `actor.id`).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Construct a validation error for a field.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Suggested next command for a (state, action) pair.
///
/// Returned guidance is embedded in [`RunError::InvalidState`] so the CLI
/// can print a hint without a lookup table of its own.
pub fn guidance_for(current: RunState, action: &str) -> Option<String> {
    let cmd = match (current, action) {
        (RunState::Draft, "bump" | "generate_notes" | "approve" | "start_publish") => {
            "capstan plan"
        }
        (RunState::Planned, "generate_notes" | "approve" | "start_publish") => "capstan bump",
        (RunState::Versioned, "approve" | "start_publish") => "capstan notes",
        (RunState::NotesReady, "start_publish") => "capstan approve",
        (RunState::Approved, "approve") => "capstan publish",
        (RunState::Failed, "start_publish") => "capstan retry",
        _ => return None,
    };
    Some(cmd.to_string())
}

fn guidance_suffix(guidance: &Option<String>) -> String {
    match guidance {
        Some(cmd) => format!(" (try: {cmd})"),
        None => String::new(),
    }
}

fn publishing_hint(current: &RunState) -> &'static str {
    if *current == RunState::Publishing {
        "; a publishing run must first complete or fail"
    } else {
        ""
    }
}
