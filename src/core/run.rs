//! core::run
//!
//! The release-run aggregate: the workflow's source of truth.
//!
//! # Architecture
//!
//! A [`ReleaseRun`] represents one attempt to cut a release from a given
//! commit of a repository. All mutation goes through aggregate methods
//! that consult the state machine ([`crate::core::machine`]) before
//! touching any field, so a rejected transition leaves the run
//! bit-for-bit unchanged.
//!
//! # Invariants
//!
//! - `state` is always one of the nine defined states; `updated_at` never
//!   moves backwards
//! - `plan_hash` is deterministic over the immutable inputs; recomputing
//!   it after a re-plan invalidates any prior approval via hash mismatch
//! - `head_sha` is immutable after creation
//! - Steps execute only while `publishing`; every step completion is
//!   recorded in history
//! - Terminal states (`published`, `cancelled`) admit no transitions
//!
//! # Events
//!
//! Every successful transition appends exactly one [`TransitionRecord`]
//! to history and emits exactly one `run.state_transitioned` domain event
//! plus a transition-specific event. The buffer is drained by the run
//! store at save time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::RunError;
use super::events::{DomainEvent, EventKind};
use super::machine::{self, GuardContext, RunEvent};
use super::types::{Actor, ActorType, CommitSha, RiskThresholds, RunId, RunState, UtcTimestamp};
use super::version::{BumpKind, Version};

/// Generated release notes and their provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseNotes {
    /// The notes text (markdown).
    pub text: String,
    /// Audience preset the generator used.
    pub audience_preset: String,
    /// Tone preset the generator used.
    pub tone_preset: String,
    /// Generator provider (e.g. `template`).
    pub provider: String,
    /// Generator model identifier, empty for deterministic generators.
    pub model: String,
    /// When the notes were generated.
    pub generated_at: UtcTimestamp,
}

/// An approval granted to a run.
///
/// The approval binds the plan hash observed at approval time; publishing
/// verifies the binding still holds, so any re-plan invalidates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    /// Approver identity.
    pub approved_by: String,
    /// When the approval was granted.
    pub approved_at: UtcTimestamp,
    /// Whether policy auto-approved without a human.
    pub auto_approved: bool,
    /// The plan hash the approval is bound to.
    pub plan_hash: String,
    /// Risk score at approval time.
    pub risk_score: f64,
    /// Kind of approver.
    pub approver_type: ActorType,
    /// Optional justification, required by some policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// One level of a multi-level approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    /// Numeric level, granted in ascending order under sequential policies.
    pub level: u32,
    /// Human-readable level name (e.g. `engineering`).
    pub name: String,
    /// Whether completion requires this level.
    pub mandatory: bool,
}

/// A multi-level approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// The levels, typically sorted ascending.
    pub levels: Vec<ApprovalLevel>,
    /// Whether grants must arrive in ascending level order.
    pub sequential: bool,
}

impl ApprovalPolicy {
    /// Mandatory levels in ascending order.
    pub fn mandatory_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self
            .levels
            .iter()
            .filter(|l| l.mandatory)
            .map(|l| l.level)
            .collect();
        levels.sort_unstable();
        levels
    }

    /// Look up a level definition.
    pub fn level(&self, level: u32) -> Option<&ApprovalLevel> {
        self.levels.iter().find(|l| l.level == level)
    }
}

/// A grant recorded against one policy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelGrant {
    /// Approver identity.
    pub approved_by: String,
    /// When the grant was recorded.
    pub approved_at: UtcTimestamp,
    /// Kind of approver.
    pub approver_type: ActorType,
    /// Optional justification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// A planned publishing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    /// Unique step name within the run.
    pub name: String,
    /// Step type (e.g. `tag`, `plugin`).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Fingerprint of the step's configuration.
    pub config_hash: String,
    /// Stable key publishers use to detect "already applied externally".
    pub idempotency_key: String,
    /// Plugin to dispatch to, for `plugin` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    /// Hook to dispatch, for `plugin` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    /// Marks steps with side effects that cannot be rolled back.
    #[serde(rename = "unsafe", default, skip_serializing_if = "std::ops::Not::not")]
    pub unsafe_step: bool,
}

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StepState {
    /// The state name as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Done => "done",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution status of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Current per-step state.
    pub state: StepState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the most recent attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<UtcTimestamp>,
    /// When the step reached a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<UtcTimestamp>,
    /// Captured output from the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl StepStatus {
    fn pending() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            output: None,
        }
    }
}

/// One entry in the run's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// When the transition happened.
    pub at: UtcTimestamp,
    /// State before.
    pub from: RunState,
    /// State after.
    pub to: RunState,
    /// The machine event that drove the transition.
    pub event: String,
    /// Actor identity.
    pub actor: String,
    /// Optional reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Optional structured context (e.g. the step name for step events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Inputs for creating a new run.
#[derive(Debug, Clone)]
pub struct NewRunParams {
    /// Logical repository identity (e.g. `org/app`).
    pub repo_id: String,
    /// Filesystem root of the repository.
    pub repo_root: PathBuf,
    /// Base of the commit window (tag or ref).
    pub base_ref: String,
    /// Head being released.
    pub head_sha: CommitSha,
    /// Ordered commit window, oldest first.
    pub commits: Vec<CommitSha>,
    /// Fingerprint of the repository configuration.
    pub config_hash: String,
    /// Fingerprint of the configured plugin plan.
    pub plugin_plan_hash: String,
    /// Who is creating the run.
    pub actor: Actor,
    /// Risk thresholds in force.
    pub thresholds: RiskThresholds,
}

/// The release-run aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRun {
    /// Stable identifier, assigned at creation.
    pub id: RunId,
    /// Deterministic fingerprint of the immutable inputs.
    pub plan_hash: String,
    /// Logical repository identity.
    pub repo_id: String,
    /// Filesystem root of the repository.
    pub repo_root: PathBuf,
    /// Base of the released window.
    pub base_ref: String,
    /// Head being released. Immutable after creation.
    pub head_sha: CommitSha,
    /// Ordered commit window, oldest first.
    pub commits: Vec<CommitSha>,
    /// Fingerprint of the configuration.
    pub config_hash: String,
    /// Fingerprint of the plugin plan.
    pub plugin_plan_hash: String,
    /// Version currently released, if known.
    pub version_current: Option<Version>,
    /// Proposed or decided next version.
    pub version_next: Option<Version>,
    /// How `version_next` was derived.
    pub bump_kind: BumpKind,
    /// Confidence in the version proposal, `[0, 1]`.
    pub confidence: f64,
    /// Assessed release risk, `[0, 1]`.
    pub risk_score: f64,
    /// Ordered textual risk factors.
    pub reasons: Vec<String>,
    /// Kind of the creating actor.
    pub actor_type: ActorType,
    /// Identity of the creating actor.
    pub actor_id: String,
    /// Approval thresholds in force.
    pub thresholds: RiskThresholds,
    /// Tag to create on publish. Defaults to `v<version_next>` at bump time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    /// Generated release notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<ReleaseNotes>,
    /// Fingerprint over the inputs used for notes generation (caching).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes_inputs_hash: Option<String>,
    /// The approval, once granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    /// Multi-level approval policy, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    /// Grants recorded per policy level.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub level_grants: BTreeMap<u32, LevelGrant>,
    /// Planned publishing steps, in execution order.
    #[serde(default)]
    pub steps: Vec<StepPlan>,
    /// Execution status per step name.
    #[serde(default)]
    pub step_status: BTreeMap<String, StepStatus>,
    /// Current workflow state.
    pub state: RunState,
    /// Ordered transition history.
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// External changeset identity, when planning consumed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset_id: Option<String>,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Last mutation time. Monotone.
    pub updated_at: UtcTimestamp,
    /// When the run reached `published`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<UtcTimestamp>,
    /// Events emitted since the last save. Not serialized.
    #[serde(skip)]
    pub domain_events: Vec<DomainEvent>,
}

/// Compute the plan hash over the immutable inputs.
///
/// Deterministic: same inputs always produce the same hash, regardless of
/// when or where it is computed.
pub fn compute_plan_hash(
    repo_id: &str,
    head_sha: &CommitSha,
    commits: &[CommitSha],
    config_hash: &str,
    plugin_plan_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(head_sha.as_str().as_bytes());
    hasher.update(b"\0");
    for commit in commits {
        hasher.update(commit.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"\0");
    hasher.update(config_hash.as_bytes());
    hasher.update(b"\0");
    hasher.update(plugin_plan_hash.as_bytes());
    hex::encode(hasher.finalize())
}

impl ReleaseRun {
    /// Create a new run in `draft` with a generated id and computed plan
    /// hash. Emits `run.created`.
    pub fn new(params: NewRunParams) -> Self {
        let now = UtcTimestamp::now();
        let id = RunId::generate();
        let plan_hash = compute_plan_hash(
            &params.repo_id,
            &params.head_sha,
            &params.commits,
            &params.config_hash,
            &params.plugin_plan_hash,
        );

        let mut run = Self {
            id: id.clone(),
            plan_hash: plan_hash.clone(),
            repo_id: params.repo_id.clone(),
            repo_root: params.repo_root,
            base_ref: params.base_ref.clone(),
            head_sha: params.head_sha.clone(),
            commits: params.commits,
            config_hash: params.config_hash,
            plugin_plan_hash: params.plugin_plan_hash,
            version_current: None,
            version_next: None,
            bump_kind: BumpKind::None,
            confidence: 0.0,
            risk_score: 0.0,
            reasons: Vec::new(),
            actor_type: params.actor.actor_type,
            actor_id: params.actor.id,
            thresholds: params.thresholds,
            tag_name: None,
            notes: None,
            notes_inputs_hash: None,
            approval: None,
            approval_policy: None,
            level_grants: BTreeMap::new(),
            steps: Vec::new(),
            step_status: BTreeMap::new(),
            state: RunState::Draft,
            history: Vec::new(),
            last_error: None,
            changeset_id: None,
            created_at: now,
            updated_at: now,
            published_at: None,
            domain_events: Vec::new(),
        };

        run.emit(EventKind::RunCreated {
            repo_id: params.repo_id,
            head_sha: params.head_sha,
            base_ref: params.base_ref,
            commit_count: run.commits.len(),
            plan_hash,
        });
        run
    }

    // =========================================================================
    // Event and transition plumbing
    // =========================================================================

    /// Append a domain event to the transient buffer.
    fn emit(&mut self, kind: EventKind) {
        self.domain_events
            .push(DomainEvent::now(self.id.clone(), kind));
    }

    /// Drain the buffered events (called by the store after a save).
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.domain_events)
    }

    /// Advance `updated_at`, never letting it move backwards.
    fn touch(&mut self) {
        let now = UtcTimestamp::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Validate and perform one machine transition.
    ///
    /// All guard checks happen in `machine::validate` before any field is
    /// touched. A state-changing transition appends exactly one history
    /// record and emits exactly one `state_transitioned` event; self-loop
    /// transitions (e.g. STEP_OK, notes regeneration) only touch
    /// `updated_at` and leave the event trail to their specific events.
    /// The caller emits the transition-specific event.
    fn transition(
        &mut self,
        event: RunEvent,
        ctx: &GuardContext<'_>,
        actor: &Actor,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), RunError> {
        let to = machine::validate(self, event, ctx)?;
        let from = self.state;
        self.state = to;
        if from != to {
            self.history.push(TransitionRecord {
                at: UtcTimestamp::now(),
                from,
                to,
                event: event.as_str().to_string(),
                actor: actor.id.clone(),
                reason: reason.clone(),
                metadata,
            });
            self.emit(EventKind::StateTransitioned {
                from,
                to,
                event: event.as_str().to_string(),
                actor: actor.to_string(),
                reason,
            });
        }
        self.touch();
        Ok(())
    }

    // =========================================================================
    // Planning and versioning
    // =========================================================================

    /// Record a version proposal.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::InvalidState`] unless the run is in `draft` or
    /// `planned`.
    pub fn set_version_proposal(
        &mut self,
        current: Version,
        next: Version,
        bump_kind: BumpKind,
        confidence: f64,
    ) -> Result<(), RunError> {
        if !matches!(self.state, RunState::Draft | RunState::Planned) {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "set_version_proposal".to_string(),
                guidance: None,
            });
        }
        self.version_current = Some(current);
        self.version_next = Some(next);
        self.bump_kind = bump_kind;
        self.confidence = confidence.clamp(0.0, 1.0);
        self.touch();
        Ok(())
    }

    /// Record the risk assessment for this run.
    pub fn set_risk(&mut self, score: f64, reasons: Vec<String>) {
        self.risk_score = score.clamp(0.0, 1.0);
        self.reasons = reasons;
        self.touch();
    }

    /// Transition to `planned` (from draft, or re-plan from versioned /
    /// notes_ready).
    ///
    /// Recomputes the plan hash; if it changed, any prior approval is
    /// invalidated by the hash binding on the next publish attempt.
    pub fn plan(&mut self, actor: &Actor, ctx: &GuardContext<'_>) -> Result<(), RunError> {
        self.transition(RunEvent::Plan, ctx, actor, None, None)?;
        self.plan_hash = compute_plan_hash(
            &self.repo_id,
            &self.head_sha,
            &self.commits,
            &self.config_hash,
            &self.plugin_plan_hash,
        );
        self.emit(EventKind::Planned {
            plan_hash: self.plan_hash.clone(),
            commit_count: self.commits.len(),
        });
        Ok(())
    }

    /// Record the concrete version and tag.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::VersionNotSet`] if no proposal was recorded.
    pub fn set_version(&mut self, next: Version, tag_name: Option<String>) -> Result<(), RunError> {
        if self.version_next.is_none() {
            return Err(RunError::VersionNotSet);
        }
        let tag = tag_name.unwrap_or_else(|| next.tag_name("v"));
        self.version_next = Some(next);
        self.tag_name = Some(tag);
        self.touch();
        Ok(())
    }

    /// Transition planned -> versioned.
    ///
    /// Defaults `tag_name` to `v<version_next>` when unset.
    pub fn bump(&mut self, actor: &Actor, ctx: &GuardContext<'_>) -> Result<(), RunError> {
        self.transition(RunEvent::Bump, ctx, actor, None, None)?;
        let version = self
            .version_next
            .clone()
            .expect("version_set guard guarantees version_next");
        if self.tag_name.is_none() {
            self.tag_name = Some(version.tag_name("v"));
        }
        self.emit(EventKind::Versioned {
            version_next: version.to_string(),
            tag_name: self.tag_name.clone().unwrap_or_default(),
            bump_kind: self.bump_kind.as_str().to_string(),
        });
        Ok(())
    }

    /// Mark that planning detected tag-push mode.
    pub fn record_tag_push_mode(&mut self, tag_name: &str, version: &Version) {
        self.emit(EventKind::TagPushModeDetected {
            tag_name: tag_name.to_string(),
            version: version.to_string(),
        });
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Transition versioned -> notes_ready (re-invocable in notes_ready
    /// to regenerate).
    ///
    /// # Errors
    ///
    /// Returns [`RunError::NotesMissing`] when `notes` is `None`.
    pub fn generate_notes(
        &mut self,
        notes: Option<ReleaseNotes>,
        inputs_hash: String,
        actor: &Actor,
        ctx: &GuardContext<'_>,
    ) -> Result<(), RunError> {
        let notes = notes.ok_or(RunError::NotesMissing)?;
        self.transition(RunEvent::GenerateNotes, ctx, actor, None, None)?;
        self.emit(EventKind::NotesGenerated {
            provider: notes.provider.clone(),
            model: notes.model.clone(),
            audience_preset: notes.audience_preset.clone(),
            tone_preset: notes.tone_preset.clone(),
            inputs_hash: inputs_hash.clone(),
        });
        self.notes = Some(notes);
        self.notes_inputs_hash = Some(inputs_hash);
        Ok(())
    }

    /// Replace the notes text, keeping provenance.
    ///
    /// Only valid in `notes_ready`, before approval.
    pub fn update_notes_text(&mut self, text: String, actor: &Actor) -> Result<(), RunError> {
        if self.state != RunState::NotesReady {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "update_notes".to_string(),
                guidance: None,
            });
        }
        let notes = self.notes.as_mut().ok_or(RunError::NotesMissing)?;
        notes.text = text;
        self.emit(EventKind::NotesUpdated {
            actor: actor.id.clone(),
        });
        self.touch();
        Ok(())
    }

    /// Replace the notes wholesale (text and provenance).
    ///
    /// Only valid in `notes_ready`, before approval.
    pub fn update_notes(&mut self, notes: ReleaseNotes, actor: &Actor) -> Result<(), RunError> {
        if self.state != RunState::NotesReady {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "update_notes".to_string(),
                guidance: None,
            });
        }
        self.notes = Some(notes);
        self.emit(EventKind::NotesUpdated {
            actor: actor.id.clone(),
        });
        self.touch();
        Ok(())
    }

    // =========================================================================
    // Approval
    // =========================================================================

    /// Transition notes_ready -> approved, binding the current plan hash
    /// and risk score into the approval record.
    ///
    /// # Errors
    ///
    /// - [`RunError::RiskTooHigh`] when risk meets the block threshold,
    ///   or when `auto` and risk meets the auto-approve threshold
    /// - [`RunError::InvalidState`] from any other state
    pub fn approve(
        &mut self,
        actor: &Actor,
        auto: bool,
        ctx: &GuardContext<'_>,
    ) -> Result<(), RunError> {
        if auto && self.risk_score >= self.thresholds.auto_approve_below {
            return Err(RunError::RiskTooHigh {
                score: self.risk_score,
                threshold: self.thresholds.auto_approve_below,
                reasons: self.reasons.clone(),
            });
        }
        self.transition(RunEvent::Approve, ctx, actor, None, None)?;
        let approval = Approval {
            approved_by: actor.id.clone(),
            approved_at: UtcTimestamp::now(),
            auto_approved: auto,
            plan_hash: self.plan_hash.clone(),
            risk_score: self.risk_score,
            approver_type: actor.actor_type,
            justification: None,
        };
        self.emit(EventKind::Approved {
            approved_by: approval.approved_by.clone(),
            auto_approved: auto,
            plan_hash: approval.plan_hash.clone(),
            risk_score: approval.risk_score,
            approver_type: approval.approver_type,
        });
        self.approval = Some(approval);
        Ok(())
    }

    /// Record a grant for one policy level. Not itself a transition.
    ///
    /// # Errors
    ///
    /// - [`RunError::InvalidState`] outside `notes_ready`
    /// - [`RunError::ApprovalLevelUnknown`] for undefined levels
    /// - [`RunError::ApprovalLevelOutOfOrder`] under a sequential policy
    ///   when a lower mandatory level is still ungranted
    pub fn approve_at_level(
        &mut self,
        level: u32,
        actor: &Actor,
        justification: Option<String>,
    ) -> Result<(), RunError> {
        if self.state != RunState::NotesReady {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "approve".to_string(),
                guidance: crate::core::errors::guidance_for(self.state, "approve"),
            });
        }
        let policy = self
            .approval_policy
            .as_ref()
            .ok_or(RunError::ApprovalLevelUnknown(level))?;
        if policy.level(level).is_none() {
            return Err(RunError::ApprovalLevelUnknown(level));
        }
        if policy.sequential {
            for lower in policy.mandatory_levels() {
                if lower >= level {
                    break;
                }
                if !self.level_grants.contains_key(&lower) {
                    return Err(RunError::ApprovalLevelOutOfOrder {
                        level,
                        missing: lower,
                    });
                }
            }
        }
        self.level_grants.insert(
            level,
            LevelGrant {
                approved_by: actor.id.clone(),
                approved_at: UtcTimestamp::now(),
                approver_type: actor.actor_type,
                justification,
            },
        );
        self.touch();
        Ok(())
    }

    /// Complete a multi-level approval: requires every mandatory level
    /// granted, then performs the single APPROVE transition.
    pub fn complete_multi_level_approval(
        &mut self,
        actor: &Actor,
        ctx: &GuardContext<'_>,
    ) -> Result<(), RunError> {
        self.validate_approval_policy()?;
        self.approve(actor, false, ctx)
    }

    /// Check the multi-level policy is satisfied (trivially true without
    /// a policy). Used as the `approval_policy_satisfied` guard.
    pub fn validate_approval_policy(&self) -> Result<(), RunError> {
        let Some(policy) = &self.approval_policy else {
            return Ok(());
        };
        let missing: Vec<u32> = policy
            .mandatory_levels()
            .into_iter()
            .filter(|l| !self.level_grants.contains_key(l))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RunError::ApprovalIncomplete { missing })
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Replace the execution plan. Only valid in `approved`, before
    /// publishing begins. Resets all step statuses to pending.
    pub fn set_execution_plan(&mut self, steps: Vec<StepPlan>) -> Result<(), RunError> {
        if self.state != RunState::Approved {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "set_execution_plan".to_string(),
                guidance: None,
            });
        }
        self.step_status = steps
            .iter()
            .map(|s| (s.name.clone(), StepStatus::pending()))
            .collect();
        self.steps = steps;
        self.touch();
        Ok(())
    }

    /// Transition approved -> publishing; verifies plan-hash integrity
    /// and the approval's plan-hash binding, and captures the step list
    /// in the event.
    pub fn start_publishing(
        &mut self,
        actor: &Actor,
        ctx: &GuardContext<'_>,
    ) -> Result<(), RunError> {
        // The stored hash must still be the fingerprint of the stored
        // inputs; divergence means the snapshot was edited out-of-band.
        let computed = compute_plan_hash(
            &self.repo_id,
            &self.head_sha,
            &self.commits,
            &self.config_hash,
            &self.plugin_plan_hash,
        );
        if computed != self.plan_hash {
            return Err(RunError::PlanHashMismatch {
                stored: self.plan_hash.clone(),
                computed,
            });
        }
        self.transition(RunEvent::StartPublish, ctx, actor, None, None)?;
        for step in &self.steps {
            self.step_status
                .entry(step.name.clone())
                .or_insert_with(StepStatus::pending);
        }
        self.emit(EventKind::PublishingStarted {
            steps: self.steps.iter().map(|s| s.name.clone()).collect(),
        });
        Ok(())
    }

    /// The first step whose status is pending, in plan order.
    pub fn next_pending_step(&self) -> Option<&StepPlan> {
        self.steps.iter().find(|s| {
            self.step_status
                .get(&s.name)
                .map(|st| st.state == StepState::Pending)
                .unwrap_or(true)
        })
    }

    /// Mark a step running and count the attempt.
    ///
    /// # Errors
    ///
    /// - [`RunError::StepNotFound`] for unknown steps
    /// - [`RunError::StepAlreadyDone`] if the step already completed
    /// - [`RunError::InvalidState`] outside `publishing`
    pub fn mark_step_started(&mut self, name: &str) -> Result<(), RunError> {
        if self.state != RunState::Publishing {
            return Err(RunError::InvalidState {
                current: self.state,
                action: "execute_step".to_string(),
                guidance: None,
            });
        }
        if !self.steps.iter().any(|s| s.name == name) {
            return Err(RunError::StepNotFound(name.to_string()));
        }
        let status = self
            .step_status
            .entry(name.to_string())
            .or_insert_with(StepStatus::pending);
        if status.state == StepState::Done {
            return Err(RunError::StepAlreadyDone(name.to_string()));
        }
        status.state = StepState::Running;
        status.attempts += 1;
        status.started_at = Some(UtcTimestamp::now());
        self.touch();
        Ok(())
    }

    /// Mark a step done. Performs the STEP_OK (publishing -> publishing)
    /// transition and records the completion in history.
    pub fn mark_step_done(
        &mut self,
        name: &str,
        output: Option<String>,
        actor: &Actor,
    ) -> Result<(), RunError> {
        self.finish_step(name, StepState::Done, output, None, actor)
    }

    /// Mark a step skipped (idempotency or dry run). STEP_OK transition.
    pub fn mark_step_skipped(
        &mut self,
        name: &str,
        output: Option<String>,
        actor: &Actor,
    ) -> Result<(), RunError> {
        self.finish_step(name, StepState::Skipped, output, None, actor)
    }

    /// Mark a step failed. Performs the STEP_FAIL (publishing -> failed)
    /// transition and records `last_error`.
    pub fn mark_step_failed(
        &mut self,
        name: &str,
        error: String,
        actor: &Actor,
    ) -> Result<(), RunError> {
        self.finish_step(name, StepState::Failed, None, Some(error), actor)
    }

    fn finish_step(
        &mut self,
        name: &str,
        final_state: StepState,
        output: Option<String>,
        error: Option<String>,
        actor: &Actor,
    ) -> Result<(), RunError> {
        if !self.steps.iter().any(|s| s.name == name) {
            return Err(RunError::StepNotFound(name.to_string()));
        }
        let event = match final_state {
            StepState::Failed => RunEvent::StepFail,
            _ => RunEvent::StepOk,
        };
        let metadata = serde_json::json!({ "step": name, "result": final_state.as_str() });
        self.transition(event, &GuardContext::default(), actor, error.clone(), Some(metadata))?;

        let status = self
            .step_status
            .entry(name.to_string())
            .or_insert_with(StepStatus::pending);
        status.state = final_state;
        status.completed_at = Some(UtcTimestamp::now());
        if output.is_some() {
            status.output = output.clone();
        }
        if error.is_some() {
            status.last_error = error.clone();
        }
        let attempts = status.attempts;

        self.emit(EventKind::StepCompleted {
            step: name.to_string(),
            state: final_state.as_str().to_string(),
            attempts,
            output,
            error: error.clone(),
        });
        if final_state == StepState::Failed {
            let message = error.unwrap_or_else(|| format!("step '{name}' failed"));
            self.last_error = Some(message.clone());
            self.emit(EventKind::Failed {
                reason: message,
                step: Some(name.to_string()),
            });
        }
        Ok(())
    }

    /// True iff every step is done or skipped and none failed.
    ///
    /// Trivially true with an empty plan.
    pub fn all_steps_succeeded(&self) -> bool {
        self.steps.iter().all(|s| {
            matches!(
                self.step_status.get(&s.name).map(|st| st.state),
                Some(StepState::Done) | Some(StepState::Skipped)
            )
        })
    }

    /// Transition publishing -> published and stamp `published_at`.
    pub fn mark_published(&mut self, actor: &Actor) -> Result<(), RunError> {
        self.transition(
            RunEvent::PublishComplete,
            &GuardContext::default(),
            actor,
            None,
            None,
        )?;
        self.published_at = Some(UtcTimestamp::now());
        self.emit(EventKind::Published {
            version: self
                .version_next
                .as_ref()
                .map(Version::to_string)
                .unwrap_or_default(),
            tag_name: self.tag_name.clone().unwrap_or_default(),
        });
        Ok(())
    }

    /// Transition publishing -> failed for non-step failures.
    pub fn mark_failed(&mut self, reason: String, actor: &Actor) -> Result<(), RunError> {
        self.transition(
            RunEvent::StepFail,
            &GuardContext::default(),
            actor,
            Some(reason.clone()),
            None,
        )?;
        self.last_error = Some(reason.clone());
        self.emit(EventKind::Failed { reason, step: None });
        Ok(())
    }

    /// Transition failed -> publishing, resetting failed steps to pending.
    ///
    /// Attempt counts are preserved so retries remain visible.
    pub fn retry_publish(&mut self, actor: &Actor) -> Result<(), RunError> {
        self.transition(
            RunEvent::RetryPublish,
            &GuardContext::default(),
            actor,
            None,
            None,
        )?;
        let mut reset = Vec::new();
        for (name, status) in self.step_status.iter_mut() {
            if status.state == StepState::Failed {
                status.state = StepState::Pending;
                status.completed_at = None;
                reset.push(name.clone());
            }
        }
        self.last_error = None;
        self.emit(EventKind::Retried { reset_steps: reset });
        Ok(())
    }

    /// Transition to cancelled from any non-terminal state except
    /// `publishing`.
    pub fn cancel(&mut self, reason: String, actor: &Actor) -> Result<(), RunError> {
        self.transition(
            RunEvent::Cancel,
            &GuardContext::default(),
            actor,
            Some(reason.clone()),
            None,
        )?;
        self.emit(EventKind::Cancelled {
            reason,
            actor: actor.id.clone(),
        });
        Ok(())
    }

    /// Record one plugin hook execution in the event stream.
    pub fn record_plugin_execution(
        &mut self,
        plugin: &str,
        hook: &str,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    ) {
        self.emit(EventKind::PluginExecuted {
            plugin: plugin.to_string(),
            hook: hook.to_string(),
            success,
            duration_ms,
            error,
        });
        self.touch();
    }

    // =========================================================================
    // Validation helpers
    // =========================================================================

    /// Check that the working tree's HEAD still matches the run's head.
    pub fn validate_head_match(&self, current_head: &CommitSha) -> Result<(), RunError> {
        if *current_head != self.head_sha {
            return Err(RunError::HeadShaChanged {
                expected: self.head_sha.clone(),
                actual: current_head.clone(),
            });
        }
        Ok(())
    }

    /// Check the approval exists and is bound to the current plan hash.
    pub fn validate_approval_plan_hash(&self) -> Result<(), RunError> {
        let approval = self.approval.as_ref().ok_or(RunError::NotApproved)?;
        if approval.plan_hash != self.plan_hash {
            return Err(RunError::ApprovalBoundToHash {
                bound: approval.plan_hash.clone(),
                current: self.plan_hash.clone(),
            });
        }
        Ok(())
    }
}
