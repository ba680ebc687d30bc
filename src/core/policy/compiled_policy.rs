// Validation and the compiled, read-only view of a policy the pipeline works
// from. Regexes are compiled once per loaded revision.

use super::policy_models::{
    GuildPolicy, KeywordRule, MAX_TIMEOUT_SECONDS, MAX_WINDOW_SECONDS,
};
use crate::core::moderation::ActionType;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

const RAID_THRESHOLD_RANGE: (u64, u64) = (3, 50);
const RAID_TIMEFRAME_RANGE: (u64, u64) = (30, 300);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rule '{rule}' has an invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        message: String,
    },

    #[error("{field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.into(),
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Check a policy before it is stored. The pipeline only ever sees policies
/// that passed this.
pub fn validate(policy: &GuildPolicy) -> Result<(), ConfigError> {
    for rule in &policy.ai.keyword_rules {
        for pattern in &rule.regex_patterns {
            if let Err(e) = compile_pattern(pattern) {
                return Err(ConfigError::InvalidPattern {
                    rule: rule.label(),
                    pattern: pattern.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    let rate = &policy.message_rate;
    if rate.analysis_window_seconds == 0 || rate.analysis_window_seconds > MAX_WINDOW_SECONDS {
        return Err(invalid(
            "message_rate.analysis_window_seconds",
            format!("must be between 1 and {}", MAX_WINDOW_SECONDS),
        ));
    }
    if rate.check_interval_seconds == 0 {
        return Err(invalid("message_rate.check_interval_seconds", "must be positive"));
    }
    if rate.low_rate_threshold >= rate.high_rate_threshold {
        return Err(invalid(
            "message_rate.low_rate_threshold",
            "must be lower than high_rate_threshold",
        ));
    }

    let raid = &policy.raid_defense;
    if !(RAID_THRESHOLD_RANGE.0..=RAID_THRESHOLD_RANGE.1).contains(&raid.join_threshold) {
        return Err(invalid(
            "raid_defense.join_threshold",
            format!(
                "must be between {} and {}",
                RAID_THRESHOLD_RANGE.0, RAID_THRESHOLD_RANGE.1
            ),
        ));
    }
    if !(RAID_TIMEFRAME_RANGE.0..=RAID_TIMEFRAME_RANGE.1).contains(&raid.join_timeframe_seconds) {
        return Err(invalid(
            "raid_defense.join_timeframe_seconds",
            format!(
                "must be between {} and {}",
                RAID_TIMEFRAME_RANGE.0, RAID_TIMEFRAME_RANGE.1
            ),
        ));
    }

    if policy.moderation.confirmation_timeout_seconds == 0 {
        return Err(invalid(
            "moderation.confirmation_timeout_seconds",
            "must be positive",
        ));
    }

    for outcome in policy.moderation.severity.values() {
        check_member_action("moderation.severity", outcome.action, outcome.duration_seconds)?;
    }

    let bot = &policy.bot_detection;
    check_member_action("bot_detection.action", bot.action, Some(bot.timeout_seconds))?;

    let verification = &policy.verification;
    if verification.max_attempts == 0 {
        return Err(invalid("verification.max_attempts", "must be positive"));
    }
    if verification.fail_action == ActionType::Warn {
        return Err(invalid(
            "verification.fail_action",
            "must be one of kick, ban or timeout",
        ));
    }
    check_member_action(
        "verification.fail_action",
        verification.fail_action,
        verification.timeout_duration_seconds.or(Some(MAX_TIMEOUT_SECONDS)),
    )?;

    Ok(())
}

fn check_member_action(
    field: &'static str,
    action: ActionType,
    duration: Option<u64>,
) -> Result<(), ConfigError> {
    if !action.targets_member() {
        return Err(invalid(field, format!("'{}' is not a member action", action)));
    }
    if action == ActionType::Timeout {
        match duration {
            Some(d) if d > 0 && d <= MAX_TIMEOUT_SECONDS => {}
            _ => {
                return Err(invalid(
                    field,
                    format!("timeouts need a duration between 1 and {} seconds", MAX_TIMEOUT_SECONDS),
                ))
            }
        }
    }
    Ok(())
}

// ============================================================================
// COMPILED POLICY
// ============================================================================

pub struct CompiledRule {
    pub rule: KeywordRule,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl CompiledRule {
    fn compile(rule: &KeywordRule, guild_id: u64) -> Self {
        let patterns = rule
            .regex_patterns
            .iter()
            .filter_map(|pattern| match compile_pattern(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    // Stored data predating validation; skip it.
                    warn!(guild_id, rule = %rule.label(), pattern, error = %e, "Skipping invalid stored pattern");
                    None
                }
            })
            .collect();

        Self {
            rule: rule.clone(),
            keywords: rule
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            patterns,
        }
    }

    pub fn matches(&self, lowered_content: &str, content: &str) -> bool {
        self.keywords.iter().any(|k| lowered_content.contains(k.as_str()))
            || self.patterns.iter().any(|re| re.is_match(content))
    }
}

/// Immutable snapshot handed to every stage for one signal.
pub struct CompiledPolicy {
    pub policy: GuildPolicy,
    pub revision: i64,
    rules: Vec<CompiledRule>,
    scam_keywords: Vec<String>,
}

pub type PolicySnapshot = Arc<CompiledPolicy>;

impl CompiledPolicy {
    pub fn compile(policy: GuildPolicy, revision: i64) -> Self {
        let rules = policy
            .ai
            .keyword_rules
            .iter()
            .map(|rule| CompiledRule::compile(rule, policy.guild_id))
            .collect();
        let scam_keywords = policy
            .bot_detection
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        Self {
            policy,
            revision,
            rules,
            scam_keywords,
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.policy.guild_id
    }

    /// Rules matching the content, in configured order.
    pub fn matching_rules(&self, content: &str) -> Vec<KeywordRule> {
        let lowered = content.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.matches(&lowered, content))
            .map(|r| r.rule.clone())
            .collect()
    }

    /// First scam keyword found in the content, if any.
    pub fn scam_keyword_hit(&self, content: &str) -> Option<&str> {
        let lowered = content.to_lowercase();
        self.scam_keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(|k| k.as_str())
    }
}
