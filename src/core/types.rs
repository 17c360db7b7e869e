//! core::types
//!
//! Strong types for core release-governance concepts.
//!
//! # Types
//!
//! - [`RunId`] - Stable identifier for a release run, safe for filenames
//! - [`CommitSha`] - Git commit identifier (SHA-1 or SHA-256)
//! - [`RunState`] - Workflow state of a release run
//! - [`Actor`] / [`ActorType`] - Who is driving an operation
//! - [`RiskThresholds`] - Approval policy thresholds
//! - [`UtcTimestamp`] - RFC3339 UTC timestamp
//!
//! # Validation
//!
//! Identifier types enforce validity at construction time. Invalid values
//! cannot be represented, preventing entire classes of bugs.
//!
//! # Examples
//!
//! ```
//! use capstan::core::types::{CommitSha, RunId, RunState};
//!
//! let sha = CommitSha::new("abc123def4567890abc123def4567890abc12345").unwrap();
//! assert_eq!(sha.short(7), "abc123d");
//!
//! let id = RunId::generate();
//! assert!(RunId::new(id.as_str()).is_ok());
//!
//! assert!(RunState::Published.is_terminal());
//! assert!(!RunState::Failed.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid run id: {0}")]
    InvalidRunId(String),

    #[error("invalid commit sha: {0}")]
    InvalidCommitSha(String),

    #[error("invalid risk score: {0}")]
    InvalidRiskScore(String),
}

/// A stable identifier for a release run.
///
/// Run ids are generated as `<utc-timestamp>-<random>` so they sort
/// chronologically and are safe to use as file names. Parsed ids only
/// need to satisfy the filename-safety rules, so ids produced by older
/// versions remain loadable.
///
/// # Example
///
/// ```
/// use capstan::core::types::RunId;
///
/// let id = RunId::generate();
/// assert!(!id.as_str().is_empty());
///
/// // Round-trips through its string form
/// let parsed = RunId::new(id.as_str()).unwrap();
/// assert_eq!(parsed, id);
///
/// // Path separators are rejected
/// assert!(RunId::new("../escape").is_err());
/// assert!(RunId::new("a/b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a new run id from the current time plus randomness.
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let entropy = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", stamp, &entropy[..6]))
    }

    /// Create a run id from an existing string.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidRunId` if the string is empty, longer than
    /// 128 characters, or contains characters unsafe for filenames.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), TypeError> {
        if id.is_empty() {
            return Err(TypeError::InvalidRunId("run id cannot be empty".into()));
        }
        if id.len() > 128 {
            return Err(TypeError::InvalidRunId(
                "run id cannot exceed 128 characters".into(),
            ));
        }
        if id.starts_with('.') {
            return Err(TypeError::InvalidRunId(
                "run id cannot start with '.'".into(),
            ));
        }
        for c in id.chars() {
            if !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
                return Err(TypeError::InvalidRunId(format!(
                    "run id cannot contain '{c}'"
                )));
            }
        }
        Ok(())
    }

    /// Get the run id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RunId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Git commit identifier (SHA-1 or SHA-256).
///
/// Normalized to lowercase for consistency.
///
/// # Example
///
/// ```
/// use capstan::core::types::CommitSha;
///
/// let sha = CommitSha::new("ABC123DEF4567890ABC123DEF4567890ABC12345").unwrap();
/// assert_eq!(sha.as_str(), "abc123def4567890abc123def4567890abc12345");
/// assert_eq!(sha.short(7), "abc123d");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitSha(String);

impl CommitSha {
    /// Create a new validated commit sha.
    ///
    /// The sha is normalized to lowercase.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidCommitSha` if the string is not a valid
    /// 40- or 64-character hex digest.
    pub fn new(sha: impl Into<String>) -> Result<Self, TypeError> {
        let sha = sha.into().to_ascii_lowercase();
        Self::validate(&sha)?;
        Ok(Self(sha))
    }

    fn validate(sha: &str) -> Result<(), TypeError> {
        if sha.len() != 40 && sha.len() != 64 {
            return Err(TypeError::InvalidCommitSha(format!(
                "expected 40 or 64 hex characters, got {}",
                sha.len()
            )));
        }
        if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TypeError::InvalidCommitSha(
                "commit sha must be hexadecimal".into(),
            ));
        }
        Ok(())
    }

    /// Get an abbreviated form of the sha.
    ///
    /// Returns the first `len` characters. If `len` exceeds the sha length,
    /// returns the full sha.
    pub fn short(&self, len: usize) -> &str {
        let end = len.min(self.0.len());
        &self.0[..end]
    }

    /// Get the sha as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CommitSha {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<CommitSha> for String {
    fn from(sha: CommitSha) -> Self {
        sha.0
    }
}

impl AsRef<str> for CommitSha {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommitSha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow state of a release run.
///
/// The state machine is:
///
/// ```text
/// draft -> planned -> versioned -> notes_ready -> approved -> publishing
///                                                                |    \
///                                                            published failed
/// ```
///
/// `failed` is retryable; `published` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Freshly created, nothing computed yet.
    Draft,
    /// Commit window and plan hash established.
    Planned,
    /// Next version decided and written.
    Versioned,
    /// Release notes generated, awaiting approval.
    NotesReady,
    /// Approved for publishing.
    Approved,
    /// Publishing steps are executing.
    Publishing,
    /// All steps succeeded. Terminal.
    Published,
    /// A publishing step failed. Retryable.
    Failed,
    /// Explicitly abandoned. Terminal.
    Cancelled,
}

impl RunState {
    /// All defined states, in lifecycle order.
    pub const ALL: [RunState; 9] = [
        RunState::Draft,
        RunState::Planned,
        RunState::Versioned,
        RunState::NotesReady,
        RunState::Approved,
        RunState::Publishing,
        RunState::Published,
        RunState::Failed,
        RunState::Cancelled,
    ];

    /// Check if no further transitions are possible from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Published | RunState::Cancelled)
    }

    /// Check if this state counts as an active (in-flight) run.
    ///
    /// Active means non-terminal and past draft.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != RunState::Draft
    }

    /// The state name as serialized in snapshots and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Draft => "draft",
            RunState::Planned => "planned",
            RunState::Versioned => "versioned",
            RunState::NotesReady => "notes_ready",
            RunState::Approved => "approved",
            RunState::Publishing => "publishing",
            RunState::Published => "published",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of principal driving an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A person at a terminal.
    Human,
    /// A CI pipeline.
    Ci,
    /// An autonomous agent.
    Agent,
}

impl Default for ActorType {
    fn default() -> Self {
        ActorType::Human
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Human => write!(f, "human"),
            ActorType::Ci => write!(f, "ci"),
            ActorType::Agent => write!(f, "agent"),
        }
    }
}

/// An identified principal performing an operation.
///
/// Every orchestrator requires a non-empty actor id; this is enforced at
/// the input-validation layer, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// What kind of principal this is.
    pub actor_type: ActorType,
    /// Identity string (username, pipeline id, agent name).
    pub id: String,
}

impl Actor {
    /// Create a human actor.
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Human,
            id: id.into(),
        }
    }

    /// Create a CI actor.
    pub fn ci(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Ci,
            id: id.into(),
        }
    }

    /// Create an agent actor.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Agent,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor_type, self.id)
    }
}

/// Risk thresholds governing approval policy.
///
/// All values are in `[0, 1]`. Serialized field names match the snapshot
/// schema, which spells them out in full.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Auto-approval is permitted when risk is strictly below this.
    #[serde(rename = "auto_approve_risk_threshold")]
    pub auto_approve_below: f64,
    /// Human approval is required when risk is at or above this.
    pub require_approval_above: f64,
    /// The release is blocked entirely when risk is at or above this.
    #[serde(rename = "block_release_above")]
    pub block_above: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            auto_approve_below: 0.3,
            require_approval_above: 0.3,
            block_above: 0.8,
        }
    }
}

impl RiskThresholds {
    /// Validate threshold ordering and range.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidRiskScore` if any threshold is outside
    /// `[0, 1]` or the ordering `auto <= require <= block` is violated.
    pub fn validate(&self) -> Result<(), TypeError> {
        for (name, v) in [
            ("auto_approve_below", self.auto_approve_below),
            ("require_approval_above", self.require_approval_above),
            ("block_above", self.block_above),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TypeError::InvalidRiskScore(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
        }
        if self.auto_approve_below > self.require_approval_above
            || self.require_approval_above > self.block_above
        {
            return Err(TypeError::InvalidRiskScore(
                "thresholds must be ordered auto <= require <= block".into(),
            ));
        }
        Ok(())
    }
}

/// A UTC timestamp in RFC3339 format.
///
/// # Example
///
/// ```
/// use capstan::core::types::UtcTimestamp;
///
/// let now = UtcTimestamp::now();
/// println!("Current time: {}", now);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(chrono::DateTime<chrono::Utc>);

impl UtcTimestamp {
    /// Create a timestamp for the current moment.
    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    /// Create a timestamp from a chrono DateTime.
    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt)
    }

    /// Get the underlying datetime.
    pub fn as_datetime(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    /// Seconds elapsed from this timestamp to `other`.
    ///
    /// Negative if `other` precedes this timestamp.
    pub fn seconds_until(&self, other: &UtcTimestamp) -> i64 {
        (other.0 - self.0).num_seconds()
    }
}

impl std::fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
