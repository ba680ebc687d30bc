// Decision engine: pure mapping from detector output and policy to a
// candidate action. No I/O, no clocks, no state.

use super::moderation_models::{
    ActionTarget, ActionType, CandidateAction, MessageSignal, SuggestedAction, Verdict,
};
use super::rule_evaluator::MatchResult;
use crate::core::policy::{GuildPolicy, RaidAutoAction};
use crate::core::raid::RaidStart;
use crate::core::rate_limit::ActivityLevel;
use chrono::{DateTime, Utc};

/// Timeout applied for a failed verification when the policy names none.
const DEFAULT_VERIFICATION_TIMEOUT_SECONDS: u64 = 60 * 60;

/// A member who ran out of verification attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationFailure {
    pub guild_id: u64,
    pub user_id: u64,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
}

impl VerificationFailure {
    pub fn source_event_id(&self) -> String {
        format!(
            "verify:{}:{}:{}",
            self.guild_id,
            self.user_id,
            self.issued_at.timestamp_millis()
        )
    }
}

/// Everything the engine can be asked to decide on.
#[derive(Debug, Clone, Copy)]
pub enum DecisionInput<'a> {
    Message {
        signal: &'a MessageSignal,
        result: &'a MatchResult,
    },
    ScamDetected {
        signal: &'a MessageSignal,
        keyword: &'a str,
    },
    Raid(&'a RaidStart),
    RateCross {
        guild_id: u64,
        channel_id: u64,
        rate: u64,
        requested_seconds: u64,
        last_applied_seconds: Option<u64>,
        checked_at: DateTime<Utc>,
    },
    VerificationFailed(&'a VerificationFailure),
}

pub fn decide(input: DecisionInput<'_>, policy: &GuildPolicy) -> Option<CandidateAction> {
    match input {
        DecisionInput::Message { signal, result } => decide_message(signal, result, policy),
        DecisionInput::ScamDetected { signal, keyword } => {
            let settings = &policy.bot_detection;
            Some(CandidateAction {
                source_event_id: signal.source_event_id(),
                guild_id: signal.guild_id,
                target: ActionTarget::User(signal.author_id),
                action_type: settings.action,
                duration_seconds: (settings.action == ActionType::Timeout)
                    .then_some(settings.timeout_seconds),
                reason: format!("Scam keyword detected: '{}'", keyword),
                rule_violated: Some("Scam / bot detection".to_string()),
                channel_id: Some(signal.channel_id),
                message_id: Some(signal.message_id),
            })
        }
        DecisionInput::Raid(raid) => decide_raid(raid),
        DecisionInput::RateCross {
            guild_id,
            channel_id,
            rate,
            requested_seconds,
            last_applied_seconds,
            checked_at,
        } => {
            // Never re-issue the value the channel already has.
            if last_applied_seconds == Some(requested_seconds) {
                return None;
            }
            let level = ActivityLevel::classify(rate, &policy.message_rate);
            Some(CandidateAction {
                source_event_id: format!(
                    "slowmode:{}:{}",
                    channel_id,
                    checked_at.timestamp_millis()
                ),
                guild_id,
                target: ActionTarget::Channel(channel_id),
                action_type: ActionType::SlowmodeAdjust,
                duration_seconds: Some(requested_seconds),
                reason: format!(
                    "{} activity: {} messages in {}s",
                    level, rate, policy.message_rate.analysis_window_seconds
                ),
                rule_violated: None,
                channel_id: Some(channel_id),
                message_id: None,
            })
        }
        DecisionInput::VerificationFailed(failure) => {
            let settings = &policy.verification;
            let duration_seconds = (settings.fail_action == ActionType::Timeout).then(|| {
                settings
                    .timeout_duration_seconds
                    .unwrap_or(DEFAULT_VERIFICATION_TIMEOUT_SECONDS)
            });
            Some(CandidateAction {
                source_event_id: failure.source_event_id(),
                guild_id: failure.guild_id,
                target: ActionTarget::User(failure.user_id),
                action_type: settings.fail_action,
                duration_seconds,
                reason: format!(
                    "Failed verification after {} attempt(s)",
                    failure.attempts
                ),
                rule_violated: Some("Verification".to_string()),
                channel_id: None,
                message_id: None,
            })
        }
    }
}

fn decide_message(
    signal: &MessageSignal,
    result: &MatchResult,
    policy: &GuildPolicy,
) -> Option<CandidateAction> {
    let Some(Verdict::Violation {
        rule_violated,
        reasoning,
        suggested,
        ..
    }) = &result.classifier_verdict
    else {
        // Clean, unknown and "not consulted" all mean no action.
        return None;
    };

    if suggested.needs_review() {
        return None;
    }

    let outcome = policy.moderation.severity.get(suggested)?;
    if !outcome.action.targets_member() {
        return None;
    }

    Some(CandidateAction {
        source_event_id: signal.source_event_id(),
        guild_id: signal.guild_id,
        target: ActionTarget::User(signal.author_id),
        action_type: outcome.action,
        duration_seconds: outcome.duration_seconds,
        reason: if reasoning.trim().is_empty() {
            rule_violated.clone()
        } else {
            reasoning.clone()
        },
        rule_violated: Some(rule_violated.clone()),
        channel_id: Some(signal.channel_id),
        message_id: Some(signal.message_id),
    })
}

fn decide_raid(raid: &RaidStart) -> Option<CandidateAction> {
    let (action_type, target) = match raid.auto_action {
        RaidAutoAction::None => return None,
        RaidAutoAction::Lockdown => (ActionType::Lockdown, ActionTarget::Guild),
        RaidAutoAction::KickNew | RaidAutoAction::BanNew if raid.suspicious_users.is_empty() => {
            return None
        }
        RaidAutoAction::KickNew => (
            ActionType::Kick,
            ActionTarget::Users(raid.suspicious_users.clone()),
        ),
        RaidAutoAction::BanNew => (
            ActionType::Ban,
            ActionTarget::Users(raid.suspicious_users.clone()),
        ),
    };

    Some(CandidateAction {
        source_event_id: raid.source_event_id(),
        guild_id: raid.guild_id,
        target,
        action_type,
        duration_seconds: None,
        reason: format!("Raid detected: {} joins", raid.join_count),
        rule_violated: Some("Raid defense".to_string()),
        channel_id: None,
        message_id: None,
    })
}

/// A verdict a moderator should look at instead of an automatic punishment.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewNotice {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub suggestion: SuggestedAction,
    pub rule_violated: String,
    pub reasoning: String,
}

pub fn review_notice(signal: &MessageSignal, result: &MatchResult) -> Option<ReviewNotice> {
    match &result.classifier_verdict {
        Some(Verdict::Violation {
            rule_violated,
            reasoning,
            suggested,
            ..
        }) if suggested.needs_review() => Some(ReviewNotice {
            guild_id: signal.guild_id,
            channel_id: signal.channel_id,
            message_id: signal.message_id,
            author_id: signal.author_id,
            suggestion: *suggested,
            rule_violated: rule_violated.clone(),
            reasoning: reasoning.clone(),
        }),
        _ => None,
    }
}
