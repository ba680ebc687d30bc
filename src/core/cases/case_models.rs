// Case and appeal records - the audit trail every decision ends up in.

use crate::core::moderation::{ActionType, CandidateAction, ModerationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Who took the action. Automated actions are recorded as the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Moderator {
    System,
    User(u64),
}

impl Moderator {
    /// Column value; 0 is the system.
    pub fn as_id(&self) -> u64 {
        match self {
            Moderator::System => 0,
            Moderator::User(id) => *id,
        }
    }

    pub fn from_id(id: u64) -> Self {
        if id == 0 {
            Moderator::System
        } else {
            Moderator::User(id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Applied,
    Reverted,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Applied => "applied",
            CaseStatus::Reverted => "reverted",
        }
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(CaseStatus::Applied),
            "reverted" => Ok(CaseStatus::Reverted),
            other => Err(format!("unknown case status '{}'", other)),
        }
    }
}

/// A persisted moderation action. Only `status` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: u64,
    pub guild_id: u64,
    pub moderator: Moderator,
    pub target_user_id: u64,
    pub action_type: ActionType,
    pub reason: String,
    pub rule_violated: Option<String>,
    pub duration_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub source_event_id: String,
    pub channel_id: Option<u64>,
    pub message_id: Option<u64>,
    pub status: CaseStatus,
}

/// A case before the ledger assigned its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCase {
    pub guild_id: u64,
    pub moderator: Moderator,
    pub target_user_id: u64,
    pub action_type: ActionType,
    pub reason: String,
    pub rule_violated: Option<String>,
    pub duration_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub source_event_id: String,
    pub channel_id: Option<u64>,
    pub message_id: Option<u64>,
}

impl NewCase {
    pub fn from_candidate(
        candidate: &CandidateAction,
        moderator: Moderator,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            guild_id: candidate.guild_id,
            moderator,
            target_user_id: candidate.target_user_id(),
            action_type: candidate.action_type,
            reason: candidate.reason.clone(),
            rule_violated: candidate.rule_violated.clone(),
            duration_seconds: candidate.duration_seconds,
            created_at,
            source_event_id: candidate.source_event_id.clone(),
            channel_id: candidate.channel_id,
            message_id: candidate.message_id,
        }
    }

    pub fn into_case(self, case_id: u64) -> Case {
        Case {
            case_id,
            guild_id: self.guild_id,
            moderator: self.moderator,
            target_user_id: self.target_user_id,
            action_type: self.action_type,
            reason: self.reason,
            rule_violated: self.rule_violated,
            duration_seconds: self.duration_seconds,
            created_at: self.created_at,
            source_event_id: self.source_event_id,
            channel_id: self.channel_id,
            message_id: self.message_id,
            status: CaseStatus::Applied,
        }
    }
}

// ============================================================================
// APPEALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Pending,
    Approved,
    Denied,
}

impl AppealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealStatus::Pending => "pending",
            AppealStatus::Approved => "approved",
            AppealStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for AppealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(AppealStatus::Pending),
            "approved" | "approve" => Ok(AppealStatus::Approved),
            "denied" | "deny" => Ok(AppealStatus::Denied),
            other => Err(format!("unknown appeal status '{}'", other)),
        }
    }
}

/// A member's request to review a case.
///
/// `original_case` is a copy taken at submission time, not a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appeal {
    pub appeal_id: Uuid,
    pub guild_id: u64,
    pub target_user_id: u64,
    pub reason: String,
    pub status: AppealStatus,
    pub original_case: Case,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appeal {
    pub fn new(original_case: Case, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            appeal_id: Uuid::new_v4(),
            guild_id: original_case.guild_id,
            target_user_id: original_case.target_user_id,
            reason,
            status: AppealStatus::Pending,
            original_case,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Case already recorded for {source_event_id} ({action_type})")]
    Duplicate {
        source_event_id: String,
        action_type: ActionType,
    },

    #[error("Case #{0} not found")]
    CaseNotFound(u64),

    #[error("Appeal {0} not found")]
    AppealNotFound(Uuid),

    #[error("No appealable case found")]
    NoAppealableCase,

    #[error("Case #{0} already has a pending appeal")]
    AppealAlreadyPending(u64),

    #[error("Appeal {0} has already been resolved")]
    AppealAlreadyResolved(Uuid),

    #[error("Appeals can only be resolved as approved or denied")]
    InvalidResolution,
}

impl From<LedgerError> for ModerationError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Storage(msg) => ModerationError::Storage(msg),
            LedgerError::Duplicate { .. } => ModerationError::DuplicateSignal(e.to_string()),
            LedgerError::CaseNotFound(_) | LedgerError::AppealNotFound(_) => {
                ModerationError::NotFound(e.to_string())
            }
            other => ModerationError::InvalidRequest(other.to_string()),
        }
    }
}
