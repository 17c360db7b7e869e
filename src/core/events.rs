//! core::events
//!
//! Domain events emitted by the release-run aggregate.
//!
//! # Design
//!
//! Events are a tagged variant: one case per event type, with the variant
//! tag serialized as the `event_name` field (e.g. `run.created`). The
//! aggregate buffers events in memory; the run store transfers them to the
//! event journal at save time and clears the buffer.
//!
//! Every event shares a small capability set: event name, occurrence time,
//! and aggregate id. Payload fields are specific to each case.

use serde::{Deserialize, Serialize};

use super::types::{ActorType, CommitSha, RunId, RunState, UtcTimestamp};

/// A domain event emitted by a release run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// The run this event belongs to.
    pub run_id: RunId,
    /// When the event occurred (emission time, not persistence time).
    pub occurred_at: UtcTimestamp,
    /// The event-specific payload, tagged with `event_name`.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DomainEvent {
    /// Create an event occurring now.
    pub fn now(run_id: RunId, kind: EventKind) -> Self {
        Self {
            run_id,
            occurred_at: UtcTimestamp::now(),
            kind,
        }
    }

    /// The event name, e.g. `run.state_transitioned`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// The event-specific payload.
///
/// Serialized internally tagged: the variant name becomes the `event_name`
/// field of the surrounding JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name")]
pub enum EventKind {
    /// A new run was created in `draft`.
    #[serde(rename = "run.created")]
    RunCreated {
        /// Logical repository identity.
        repo_id: String,
        /// The head being released.
        head_sha: CommitSha,
        /// The base of the commit window.
        base_ref: String,
        /// Number of commits in the window.
        commit_count: usize,
        /// Fingerprint of the immutable inputs.
        plan_hash: String,
    },

    /// The run moved from one state to another.
    ///
    /// Every successful transition emits exactly one of these, alongside
    /// its transition-specific event.
    #[serde(rename = "run.state_transitioned")]
    StateTransitioned {
        /// State before the transition.
        from: RunState,
        /// State after the transition.
        to: RunState,
        /// The machine event that drove the transition.
        event: String,
        /// Who drove it.
        actor: String,
        /// Optional free-text reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Planning completed (or re-ran).
    #[serde(rename = "run.planned")]
    Planned {
        /// The plan hash after planning.
        plan_hash: String,
        /// Number of commits in the window.
        commit_count: usize,
    },

    /// The version decision was applied.
    #[serde(rename = "run.versioned")]
    Versioned {
        /// The chosen next version.
        version_next: String,
        /// The tag that will be created on publish.
        tag_name: String,
        /// How the version was derived.
        bump_kind: String,
    },

    /// Release notes were generated.
    #[serde(rename = "run.notes_generated")]
    NotesGenerated {
        /// Generator provider (e.g. `template`).
        provider: String,
        /// Generator model identifier, if any.
        model: String,
        /// Audience preset used.
        audience_preset: String,
        /// Tone preset used.
        tone_preset: String,
        /// Fingerprint over the generation inputs.
        inputs_hash: String,
    },

    /// Release notes were edited after generation.
    #[serde(rename = "run.notes_updated")]
    NotesUpdated {
        /// Who edited them.
        actor: String,
    },

    /// The run was approved for publishing.
    #[serde(rename = "run.approved")]
    Approved {
        /// Approver identity.
        approved_by: String,
        /// Whether policy auto-approved.
        auto_approved: bool,
        /// The plan hash the approval is bound to.
        plan_hash: String,
        /// Risk score at approval time.
        risk_score: f64,
        /// Kind of approver.
        approver_type: ActorType,
    },

    /// Step execution began.
    #[serde(rename = "run.publishing_started")]
    PublishingStarted {
        /// Names of the planned steps, in execution order.
        steps: Vec<String>,
    },

    /// A publishing step reached a final per-step state.
    #[serde(rename = "run.step_completed")]
    StepCompleted {
        /// Step name.
        step: String,
        /// Final per-step state (`done`, `failed`, `skipped`).
        state: String,
        /// Attempts made so far.
        attempts: u32,
        /// Captured output, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        /// Failure message, if the step failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A plugin hook execution finished.
    #[serde(rename = "run.plugin_executed")]
    PluginExecuted {
        /// Plugin name.
        plugin: String,
        /// Hook that was dispatched.
        hook: String,
        /// Whether the plugin reported success.
        success: bool,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Failure message, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The run reached `published`.
    #[serde(rename = "run.published")]
    Published {
        /// The released version.
        version: String,
        /// The tag that was created.
        tag_name: String,
    },

    /// The run reached `failed`.
    #[serde(rename = "run.failed")]
    Failed {
        /// Why publishing failed.
        reason: String,
        /// The failing step, when the failure is step-scoped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },

    /// The run was cancelled.
    #[serde(rename = "run.cancelled")]
    Cancelled {
        /// Why it was cancelled.
        reason: String,
        /// Who cancelled it.
        actor: String,
    },

    /// A failed publish was retried.
    #[serde(rename = "run.retried")]
    Retried {
        /// Steps that were reset to pending.
        reset_steps: Vec<String>,
    },

    /// Planning detected tag-push mode (explicit tag + version supplied).
    #[serde(rename = "run.tag_push_mode_detected")]
    TagPushModeDetected {
        /// The caller-supplied tag name.
        tag_name: String,
        /// The caller-supplied version.
        version: String,
    },
}

impl EventKind {
    /// The event name, as serialized in envelopes and journals.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunCreated { .. } => "run.created",
            EventKind::StateTransitioned { .. } => "run.state_transitioned",
            EventKind::Planned { .. } => "run.planned",
            EventKind::Versioned { .. } => "run.versioned",
            EventKind::NotesGenerated { .. } => "run.notes_generated",
            EventKind::NotesUpdated { .. } => "run.notes_updated",
            EventKind::Approved { .. } => "run.approved",
            EventKind::PublishingStarted { .. } => "run.publishing_started",
            EventKind::StepCompleted { .. } => "run.step_completed",
            EventKind::PluginExecuted { .. } => "run.plugin_executed",
            EventKind::Published { .. } => "run.published",
            EventKind::Failed { .. } => "run.failed",
            EventKind::Cancelled { .. } => "run.cancelled",
            EventKind::Retried { .. } => "run.retried",
            EventKind::TagPushModeDetected { .. } => "run.tag_push_mode_detected",
        }
    }

    /// The payload as a JSON object, without the `event_name` tag.
    ///
    /// Used by the journal, whose envelope carries the name separately.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("event_name");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(c: char) -> CommitSha {
        CommitSha::new(c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn event_name_is_serde_tag() {
        let kind = EventKind::Planned {
            plan_hash: "abcd".into(),
            commit_count: 3,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event_name"], "run.planned");
        assert_eq!(json["commit_count"], 3);
    }

    #[test]
    fn payload_strips_tag() {
        let kind = EventKind::Published {
            version: "1.1.0".into(),
            tag_name: "v1.1.0".into(),
        };
        let payload = kind.payload();
        assert!(payload.get("event_name").is_none());
        assert_eq!(payload["tag_name"], "v1.1.0");
    }

    #[test]
    fn round_trips_through_json() {
        let event = DomainEvent::now(
            RunId::new("run-1").unwrap(),
            EventKind::RunCreated {
                repo_id: "org/app".into(),
                head_sha: sha('a'),
                base_ref: "v1.0.0".into(),
                commit_count: 2,
                plan_hash: "deadbeef".into(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.name(), "run.created");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let kind = EventKind::StepCompleted {
            step: "tag".into(),
            state: "done".into(),
            attempts: 1,
            output: None,
            error: None,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert!(json.get("output").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn all_names_are_distinct() {
        let names = [
            "run.created",
            "run.state_transitioned",
            "run.planned",
            "run.versioned",
            "run.notes_generated",
            "run.notes_updated",
            "run.approved",
            "run.publishing_started",
            "run.step_completed",
            "run.plugin_executed",
            "run.published",
            "run.failed",
            "run.cancelled",
            "run.retried",
            "run.tag_push_mode_detected",
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
