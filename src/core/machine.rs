//! core::machine
//!
//! Declarative state machine for release runs.
//!
//! # Architecture
//!
//! The machine is a const table of transitions (event, valid-from states,
//! target state, guards). Aggregate methods never hard-code transition
//! targets; they ask [`validate`] for the target state and only then
//! mutate. A rejected transition therefore mutates nothing.
//!
//! Guards are pure predicates over `(run, current_head, force)`. The
//! `head_matches` guard is bypassed by `force = true`; all others are
//! mandatory.
//!
//! # Export
//!
//! [`export`] renders the table as a statechart-style JSON document so
//! external visualizers can draw the machine without reading this source.

use serde::{Deserialize, Serialize};

use super::errors::{guidance_for, RunError};
use super::run::ReleaseRun;
use super::types::{CommitSha, RunState};

/// Events that drive the release-run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Plan,
    Bump,
    GenerateNotes,
    Approve,
    StartPublish,
    StepOk,
    StepFail,
    PublishComplete,
    RetryPublish,
    Cancel,
}

impl RunEvent {
    /// Lowercase event name used in history records and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEvent::Plan => "plan",
            RunEvent::Bump => "bump",
            RunEvent::GenerateNotes => "generate_notes",
            RunEvent::Approve => "approve",
            RunEvent::StartPublish => "start_publish",
            RunEvent::StepOk => "step_ok",
            RunEvent::StepFail => "step_fail",
            RunEvent::PublishComplete => "publish_complete",
            RunEvent::RetryPublish => "retry_publish",
            RunEvent::Cancel => "cancel",
        }
    }

    /// Uppercase event name used in the machine export.
    pub fn export_name(&self) -> &'static str {
        match self {
            RunEvent::Plan => "PLAN",
            RunEvent::Bump => "BUMP",
            RunEvent::GenerateNotes => "GENERATE_NOTES",
            RunEvent::Approve => "APPROVE",
            RunEvent::StartPublish => "START_PUBLISH",
            RunEvent::StepOk => "STEP_OK",
            RunEvent::StepFail => "STEP_FAIL",
            RunEvent::PublishComplete => "PUBLISH_COMPLETE",
            RunEvent::RetryPublish => "RETRY_PUBLISH",
            RunEvent::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pure guard predicates gating transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The working tree's HEAD still matches the run's recorded head.
    /// Bypassed by `force`.
    HeadMatches,
    /// A next version has been recorded.
    VersionSet,
    /// The approval policy (single or multi-level) is satisfiable.
    ApprovalPolicySatisfied,
    /// Risk score is below the block threshold.
    NotBlockedByRisk,
    /// The stored approval is bound to the current plan hash.
    ApprovalPlanHashMatches,
    /// Every step is done or skipped and none failed.
    AllStepsSucceeded,
}

impl Guard {
    /// Guard name used in the machine export.
    pub fn as_str(&self) -> &'static str {
        match self {
            Guard::HeadMatches => "head_matches",
            Guard::VersionSet => "version_set",
            Guard::ApprovalPolicySatisfied => "approval_policy_satisfied",
            Guard::NotBlockedByRisk => "not_blocked_by_risk",
            Guard::ApprovalPlanHashMatches => "approval_plan_hash_matches",
            Guard::AllStepsSucceeded => "all_steps_succeeded",
        }
    }
}

/// One row of the transition table.
#[derive(Debug)]
pub struct Transition {
    /// The driving event.
    pub event: RunEvent,
    /// States the event is valid from.
    pub from: &'static [RunState],
    /// The target state.
    pub to: RunState,
    /// Guards that must all pass.
    pub guards: &'static [Guard],
}

/// The full transition table.
///
/// This is the machine's single source of truth; [`validate`] and
/// [`export`] both read it.
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        event: RunEvent::Plan,
        from: &[RunState::Draft, RunState::Versioned, RunState::NotesReady],
        to: RunState::Planned,
        guards: &[Guard::HeadMatches],
    },
    Transition {
        event: RunEvent::Bump,
        from: &[RunState::Planned],
        to: RunState::Versioned,
        guards: &[Guard::HeadMatches, Guard::VersionSet],
    },
    Transition {
        event: RunEvent::GenerateNotes,
        from: &[RunState::Versioned, RunState::NotesReady],
        to: RunState::NotesReady,
        guards: &[Guard::HeadMatches],
    },
    Transition {
        event: RunEvent::Approve,
        from: &[RunState::NotesReady],
        to: RunState::Approved,
        guards: &[
            Guard::HeadMatches,
            Guard::ApprovalPolicySatisfied,
            Guard::NotBlockedByRisk,
        ],
    },
    Transition {
        event: RunEvent::StartPublish,
        from: &[RunState::Approved],
        to: RunState::Publishing,
        guards: &[Guard::HeadMatches, Guard::ApprovalPlanHashMatches],
    },
    Transition {
        event: RunEvent::StepOk,
        from: &[RunState::Publishing],
        to: RunState::Publishing,
        guards: &[],
    },
    Transition {
        event: RunEvent::StepFail,
        from: &[RunState::Publishing],
        to: RunState::Failed,
        guards: &[],
    },
    Transition {
        event: RunEvent::PublishComplete,
        from: &[RunState::Publishing],
        to: RunState::Published,
        guards: &[Guard::AllStepsSucceeded],
    },
    Transition {
        event: RunEvent::RetryPublish,
        from: &[RunState::Failed],
        to: RunState::Publishing,
        guards: &[],
    },
    Transition {
        event: RunEvent::Cancel,
        from: &[
            RunState::Draft,
            RunState::Planned,
            RunState::Versioned,
            RunState::NotesReady,
            RunState::Approved,
            RunState::Failed,
        ],
        to: RunState::Cancelled,
        guards: &[],
    },
];

/// Context available to guard evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardContext<'a> {
    /// The working tree's current HEAD, when the caller has read it.
    /// `None` skips the head check (e.g. pure in-memory transitions).
    pub current_head: Option<&'a CommitSha>,
    /// Bypass `head_matches` (and only that guard).
    pub force: bool,
}

/// Validate that `event` may fire from the run's current state.
///
/// Returns the target state on success. On rejection returns a typed
/// error; the run is untouched (this function never mutates).
///
/// # Errors
///
/// - [`RunError::InvalidState`] when no table row matches (with CLI
///   guidance when one exists)
/// - [`RunError::CannotCancel`] / [`RunError::CannotRetry`] for their
///   dedicated events
/// - guard-specific errors ([`RunError::HeadShaChanged`],
///   [`RunError::VersionNotSet`], [`RunError::RiskTooHigh`], ...)
pub fn validate(
    run: &ReleaseRun,
    event: RunEvent,
    ctx: &GuardContext<'_>,
) -> Result<RunState, RunError> {
    let transition = TRANSITIONS
        .iter()
        .find(|t| t.event == event && t.from.contains(&run.state))
        .ok_or_else(|| reject(run.state, event))?;

    for guard in transition.guards {
        check_guard(*guard, run, ctx)?;
    }

    Ok(transition.to)
}

fn reject(current: RunState, event: RunEvent) -> RunError {
    match event {
        RunEvent::Cancel => RunError::CannotCancel { current },
        RunEvent::RetryPublish => RunError::CannotRetry { current },
        RunEvent::StartPublish if current == RunState::Published => RunError::AlreadyPublished,
        _ => RunError::InvalidState {
            current,
            action: event.as_str().to_string(),
            guidance: guidance_for(current, event.as_str()),
        },
    }
}

fn check_guard(guard: Guard, run: &ReleaseRun, ctx: &GuardContext<'_>) -> Result<(), RunError> {
    match guard {
        Guard::HeadMatches => {
            if ctx.force {
                return Ok(());
            }
            match ctx.current_head {
                Some(actual) if *actual != run.head_sha => Err(RunError::HeadShaChanged {
                    expected: run.head_sha.clone(),
                    actual: actual.clone(),
                }),
                _ => Ok(()),
            }
        }
        Guard::VersionSet => {
            if run.version_next.is_some() {
                Ok(())
            } else {
                Err(RunError::VersionNotSet)
            }
        }
        Guard::ApprovalPolicySatisfied => run.validate_approval_policy(),
        Guard::NotBlockedByRisk => {
            if run.risk_score >= run.thresholds.block_above {
                Err(RunError::RiskTooHigh {
                    score: run.risk_score,
                    threshold: run.thresholds.block_above,
                    reasons: run.reasons.clone(),
                })
            } else {
                Ok(())
            }
        }
        Guard::ApprovalPlanHashMatches => run.validate_approval_plan_hash(),
        Guard::AllStepsSucceeded => {
            if run.all_steps_succeeded() {
                Ok(())
            } else {
                Err(RunError::InvalidState {
                    current: run.state,
                    action: RunEvent::PublishComplete.as_str().to_string(),
                    guidance: Some("capstan publish".to_string()),
                })
            }
        }
    }
}

/// A statechart-style description of the machine, suitable for external
/// visualizers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineExport {
    /// Machine identifier.
    pub id: String,
    /// The initial state.
    pub initial: String,
    /// Per-state event maps.
    pub states: serde_json::Map<String, serde_json::Value>,
    /// Terminal states.
    #[serde(rename = "final")]
    pub final_states: Vec<String>,
}

/// Export the transition table as a declarative JSON document.
///
/// States appear in lifecycle order; each state's `on` map lists the
/// events valid from it with their target and guard conditions.
pub fn export() -> MachineExport {
    let mut states = serde_json::Map::new();

    for state in RunState::ALL {
        let mut on = serde_json::Map::new();
        for t in TRANSITIONS {
            if !t.from.contains(&state) {
                continue;
            }
            let mut entry = serde_json::Map::new();
            entry.insert(
                "target".to_string(),
                serde_json::Value::String(t.to.as_str().to_string()),
            );
            if !t.guards.is_empty() {
                entry.insert(
                    "cond".to_string(),
                    serde_json::Value::Array(
                        t.guards
                            .iter()
                            .map(|g| serde_json::Value::String(g.as_str().to_string()))
                            .collect(),
                    ),
                );
            }
            on.insert(
                t.event.export_name().to_string(),
                serde_json::Value::Object(entry),
            );
        }

        let mut node = serde_json::Map::new();
        if state.is_terminal() {
            node.insert(
                "type".to_string(),
                serde_json::Value::String("final".to_string()),
            );
        }
        if !on.is_empty() {
            node.insert("on".to_string(), serde_json::Value::Object(on));
        }
        states.insert(state.as_str().to_string(), serde_json::Value::Object(node));
    }

    MachineExport {
        id: "capstan-release".to_string(),
        initial: RunState::Draft.as_str().to_string(),
        states,
        final_states: RunState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_is_reachable_or_initial() {
        let mut targets: std::collections::HashSet<RunState> =
            TRANSITIONS.iter().map(|t| t.to).collect();
        targets.insert(RunState::Draft);
        for state in RunState::ALL {
            assert!(targets.contains(&state), "{state} is unreachable");
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for t in TRANSITIONS {
            for from in t.from {
                assert!(!from.is_terminal(), "{from} must not have outgoing edges");
            }
        }
    }

    #[test]
    fn publishing_cannot_cancel() {
        let cancel = TRANSITIONS
            .iter()
            .find(|t| t.event == RunEvent::Cancel)
            .unwrap();
        assert!(!cancel.from.contains(&RunState::Publishing));
    }

    #[test]
    fn export_shape() {
        let machine = export();
        assert_eq!(machine.initial, "draft");
        assert_eq!(machine.final_states, vec!["published", "cancelled"]);

        let draft = machine.states.get("draft").unwrap();
        let plan = &draft["on"]["PLAN"];
        assert_eq!(plan["target"], "planned");
        assert_eq!(plan["cond"][0], "head_matches");

        let published = machine.states.get("published").unwrap();
        assert_eq!(published["type"], "final");
        assert!(published.get("on").is_none());
    }

    #[test]
    fn export_round_trips() {
        let machine = export();
        let json = serde_json::to_string_pretty(&machine).unwrap();
        let back: MachineExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.initial, machine.initial);
        assert_eq!(back.states.len(), machine.states.len());
    }

    #[test]
    fn one_row_per_event_state_pair() {
        let mut seen = std::collections::HashSet::new();
        for t in TRANSITIONS {
            for from in t.from {
                assert!(
                    seen.insert((t.event, *from)),
                    "duplicate row for {:?} from {from}",
                    t.event
                );
            }
        }
    }
}
