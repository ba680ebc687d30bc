// Verification tokens for new members.
//
// The challenge itself happens outside the bot; the pipeline only issues a
// short-lived token and treats redemption as pass/fail. Running out of
// attempts feeds a VerificationFailure into the normal decision path.

use crate::core::moderation::{DecisionInput, VerificationFailure, VerificationSignal};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

/// How long an issued token stays valid.
pub const TOKEN_TTL_MINUTES: i64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("No verification pending for this member")]
    NotPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationToken {
    pub guild_id: u64,
    pub user_id: u64,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Verified,
    Retry { remaining_attempts: u32 },
    Failed(VerificationFailure),
}

impl VerificationOutcome {
    pub fn as_decision_input(&self) -> Option<DecisionInput<'_>> {
        match self {
            VerificationOutcome::Failed(failure) => Some(DecisionInput::VerificationFailed(failure)),
            _ => None,
        }
    }
}

struct PendingVerification {
    token: VerificationToken,
    failed_attempts: u32,
}

pub struct VerificationService {
    pending: DashMap<(u64, u64), PendingVerification>,
    ttl: ChronoDuration,
}

impl Default for VerificationService {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl VerificationService {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            ttl: ChronoDuration::minutes(TOKEN_TTL_MINUTES),
        }
    }

    /// Issue (or re-issue) a token. Re-issuing keeps the failure count.
    pub fn issue(&self, guild_id: u64, user_id: u64, now: DateTime<Utc>) -> VerificationToken {
        let token = VerificationToken {
            guild_id,
            user_id,
            token: generate_token(),
            issued_at: now,
            expires_at: now + self.ttl,
        };

        self.pending
            .entry((guild_id, user_id))
            .and_modify(|p| p.token = token.clone())
            .or_insert_with(|| PendingVerification {
                token: token.clone(),
                failed_attempts: 0,
            });

        debug!(guild_id, user_id, "Verification token issued");
        token
    }

    pub fn is_pending(&self, guild_id: u64, user_id: u64) -> bool {
        self.pending.contains_key(&(guild_id, user_id))
    }

    /// Check a submitted token. Wrong and expired tokens both count as a failed attempt.
    pub fn redeem(
        &self,
        signal: &VerificationSignal,
        max_attempts: u32,
    ) -> Result<VerificationOutcome, VerificationError> {
        let key = (signal.guild_id, signal.user_id);
        let mut pending = self
            .pending
            .get_mut(&key)
            .ok_or(VerificationError::NotPending)?;

        let valid = pending.token.token == signal.token.trim()
            && signal.submitted_at <= pending.token.expires_at;

        if valid {
            drop(pending);
            self.pending.remove(&key);
            info!(guild_id = signal.guild_id, user_id = signal.user_id, "Member verified");
            return Ok(VerificationOutcome::Verified);
        }

        pending.failed_attempts += 1;
        let attempts = pending.failed_attempts;
        let issued_at = pending.token.issued_at;

        if attempts < max_attempts.max(1) {
            return Ok(VerificationOutcome::Retry {
                remaining_attempts: max_attempts - attempts,
            });
        }

        drop(pending);
        self.pending.remove(&key);
        info!(
            guild_id = signal.guild_id,
            user_id = signal.user_id,
            attempts,
            "Verification failed"
        );
        Ok(VerificationOutcome::Failed(VerificationFailure {
            guild_id: signal.guild_id,
            user_id: signal.user_id,
            attempts,
            issued_at,
        }))
    }

    /// Forget tokens that expired more than one TTL ago.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        self.pending.retain(|_, p| p.token.expires_at > cutoff);
    }
}
