// Moderation domain models - signals, verdicts and candidate actions.
//
// These are pure domain types with no Discord dependencies.
// The Discord layer converts gateway events into signals and candidate
// actions back into platform calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// ACTIONS
// ============================================================================

/// Every punitive or corrective action the pipeline can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Warn,
    Timeout,
    Kick,
    Ban,
    Lockdown,
    SlowmodeAdjust,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::Warn,
        ActionType::Timeout,
        ActionType::Kick,
        ActionType::Ban,
        ActionType::Lockdown,
        ActionType::SlowmodeAdjust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Warn => "warn",
            ActionType::Timeout => "timeout",
            ActionType::Kick => "kick",
            ActionType::Ban => "ban",
            ActionType::Lockdown => "lockdown",
            ActionType::SlowmodeAdjust => "slowmode_adjust",
        }
    }

    /// Actions aimed at a single member (as opposed to a channel or the guild).
    pub fn targets_member(&self) -> bool {
        matches!(
            self,
            ActionType::Warn | ActionType::Timeout | ActionType::Kick | ActionType::Ban
        )
    }

    /// Actions a member may file an appeal against.
    pub fn is_appealable(&self) -> bool {
        matches!(self, ActionType::Timeout | ActionType::Kick | ActionType::Ban)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown action type '{}'", s))
    }
}

/// What the classifier (or a keyword rule in override mode) suggests.
///
/// The policy decides what each suggestion turns into; the engine never
/// hardcodes severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    Ignore,
    Warn,
    Delete,
    TimeoutShort,
    TimeoutMedium,
    TimeoutLong,
    Kick,
    Ban,
    NotifyMods,
    Suicidal,
}

impl SuggestedAction {
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        let action = match normalized.as_str() {
            "IGNORE" => SuggestedAction::Ignore,
            "WARN" => SuggestedAction::Warn,
            "DELETE" => SuggestedAction::Delete,
            "TIMEOUT_SHORT" => SuggestedAction::TimeoutShort,
            "TIMEOUT_MEDIUM" => SuggestedAction::TimeoutMedium,
            "TIMEOUT_LONG" => SuggestedAction::TimeoutLong,
            "KICK" => SuggestedAction::Kick,
            "BAN" => SuggestedAction::Ban,
            "NOTIFY_MODS" => SuggestedAction::NotifyMods,
            "SUICIDAL" => SuggestedAction::Suicidal,
            _ => return None,
        };
        Some(action)
    }

    /// Suggestions that ask for human attention instead of a punishment.
    pub fn needs_review(&self) -> bool {
        matches!(self, SuggestedAction::NotifyMods | SuggestedAction::Suicidal)
    }
}

// ============================================================================
// VERDICTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    Classifier,
    Rule,
}

/// Outcome of analysing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nothing wrong with the message.
    Clean { reasoning: String },
    /// A rule was broken.
    Violation {
        rule_violated: String,
        reasoning: String,
        suggested: SuggestedAction,
        source: VerdictSource,
    },
    /// The classifier could not answer (timeout, transport failure).
    /// Always treated as "no action".
    Unknown { reason: String },
}

impl Verdict {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Verdict::Unknown { .. })
    }
}

// ============================================================================
// SIGNALS
// ============================================================================

/// A guild message observed on the platform.
#[derive(Debug, Clone)]
pub struct MessageSignal {
    pub message_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub author_name: String,
    pub author_role_ids: Vec<u64>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageSignal {
    pub fn source_event_id(&self) -> String {
        format!("msg:{}", self.message_id)
    }
}

/// A member joining a guild.
#[derive(Debug, Clone)]
pub struct JoinSignal {
    pub guild_id: u64,
    pub user_id: u64,
    pub account_created_at: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl JoinSignal {
    pub fn source_event_id(&self) -> String {
        format!(
            "join:{}:{}:{}",
            self.guild_id,
            self.user_id,
            self.joined_at.timestamp_millis()
        )
    }
}

/// A member answering the external verification challenge.
#[derive(Debug, Clone)]
pub struct VerificationSignal {
    pub guild_id: u64,
    pub user_id: u64,
    pub token: String,
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// CANDIDATE ACTIONS
// ============================================================================

/// Who or what an action is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTarget {
    User(u64),
    /// Several members hit by the same decision (raid clean-up).
    Users(Vec<u64>),
    Channel(u64),
    Guild,
}

/// Target id recorded on cases for guild- or channel-level actions.
pub const NO_TARGET_USER: u64 = 0;

/// A decision that something should happen, before confirmation and execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAction {
    /// Identifier of the originating signal. The same signal never yields two cases.
    pub source_event_id: String,
    pub guild_id: u64,
    pub target: ActionTarget,
    pub action_type: ActionType,
    pub duration_seconds: Option<u64>,
    pub reason: String,
    pub rule_violated: Option<String>,
    pub channel_id: Option<u64>,
    pub message_id: Option<u64>,
}

impl CandidateAction {
    /// Split a multi-member action into one candidate per member.
    ///
    /// Each split candidate gets its own source id so idempotency is tracked
    /// per member.
    pub fn split_targets(self) -> Vec<CandidateAction> {
        match &self.target {
            ActionTarget::Users(users) => users
                .iter()
                .map(|user_id| CandidateAction {
                    source_event_id: format!("{}:{}", self.source_event_id, user_id),
                    target: ActionTarget::User(*user_id),
                    ..self.clone()
                })
                .collect(),
            _ => vec![self],
        }
    }

    /// The user id recorded on the case.
    pub fn target_user_id(&self) -> u64 {
        match self.target {
            ActionTarget::User(id) => id,
            _ => NO_TARGET_USER,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Top-level error taxonomy for the pipeline.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient platform error: {0}")]
    TransientPlatform(String),

    #[error("Missing permission: {0}")]
    Permission(String),

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Duplicate signal: {0}")]
    DuplicateSignal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
