// Keyword/regex rules plus the external content classifier.
//
// The classifier is a port; the evaluator owns the analysis-mode routing,
// the timeout, and the degraded-mode accounting when the classifier cannot
// answer.

use super::moderation_models::{MessageSignal, ModerationError, SuggestedAction, Verdict, VerdictSource};
use crate::core::policy::{AnalysisMode, CompiledPolicy, KeywordRule};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Log target for events where moderation ran without the classifier.
pub const DEGRADED_TARGET: &str = "automod::degraded";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier not configured: {0}")]
    Unavailable(String),

    #[error("Classifier request failed: {0}")]
    Transport(String),

    #[error("Classifier returned an unreadable answer: {0}")]
    Malformed(String),
}

impl From<ClassifierError> for ModerationError {
    fn from(e: ClassifierError) -> Self {
        ModerationError::ClassifierUnavailable(e.to_string())
    }
}

/// Everything the classifier gets to see for one message.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub guild_id: u64,
    pub channel_id: u64,
    pub author_name: String,
    pub content: String,
    pub rules: Vec<KeywordRule>,
    pub matched_rules: Vec<String>,
    pub channel_rules: Option<String>,
}

#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError>;
}

#[async_trait]
impl ContentClassifier for Box<dyn ContentClassifier> {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        (**self).classify(request).await
    }
}

#[derive(Deserialize)]
struct RawClassification {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    violation: bool,
    #[serde(default)]
    rule_violated: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

/// Parse the classifier's JSON answer. Surrounding prose and code fences are
/// tolerated.
pub fn parse_classification(text: &str) -> Result<Verdict, ClassifierError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(ClassifierError::Malformed("no JSON object in answer".to_string())),
    };

    let raw: RawClassification =
        serde_json::from_str(json).map_err(|e| ClassifierError::Malformed(e.to_string()))?;

    let suggested = match raw.action.as_deref() {
        None => SuggestedAction::Ignore,
        Some(action) => SuggestedAction::parse(action)
            .ok_or_else(|| ClassifierError::Malformed(format!("unknown action '{}'", action)))?,
    };

    if suggested == SuggestedAction::Ignore || (!raw.violation && !suggested.needs_review()) {
        return Ok(Verdict::Clean {
            reasoning: raw.reasoning,
        });
    }

    Ok(Verdict::Violation {
        rule_violated: raw
            .rule_violated
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Unspecified".to_string()),
        reasoning: raw.reasoning,
        suggested,
        source: VerdictSource::Classifier,
    })
}

/// Result of evaluating one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched_rules: Vec<KeywordRule>,
    /// `None` when the classifier was not consulted.
    pub classifier_verdict: Option<Verdict>,
}

pub struct RuleEvaluator<C: ContentClassifier> {
    classifier: C,
    timeout: Duration,
    degraded: AtomicU64,
}

impl<C: ContentClassifier> RuleEvaluator<C> {
    pub fn new(classifier: C, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
            degraded: AtomicU64::new(0),
        }
    }

    /// Number of messages evaluated without a classifier answer.
    pub fn degraded_events(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Evaluate a message under the policy's analysis mode.
    ///
    /// Returns `None` if `cancel` fired first (the message was deleted or
    /// otherwise superseded).
    pub async fn evaluate(
        &self,
        message: &MessageSignal,
        policy: &CompiledPolicy,
        cancel: &CancellationToken,
    ) -> Option<MatchResult> {
        let matched_rules = policy.matching_rules(&message.content);

        match policy.policy.ai.analysis_mode {
            AnalysisMode::RulesOnly if matched_rules.is_empty() => {
                return Some(MatchResult {
                    matched_rules,
                    classifier_verdict: None,
                });
            }
            AnalysisMode::Override if !matched_rules.is_empty() => {
                let rule = &matched_rules[0];
                debug!(
                    guild_id = message.guild_id,
                    message_id = message.message_id,
                    rule = %rule.label(),
                    "Rule match overrides classifier"
                );
                let verdict = if rule.action == SuggestedAction::Ignore {
                    Verdict::Clean {
                        reasoning: format!("Matched rule '{}'", rule.label()),
                    }
                } else {
                    Verdict::Violation {
                        rule_violated: rule.label(),
                        reasoning: format!("Matched rule '{}'", rule.label()),
                        suggested: rule.action,
                        source: VerdictSource::Rule,
                    }
                };
                return Some(MatchResult {
                    classifier_verdict: Some(verdict),
                    matched_rules,
                });
            }
            _ => {}
        }

        let request = ClassificationRequest {
            guild_id: message.guild_id,
            channel_id: message.channel_id,
            author_name: message.author_name.clone(),
            content: message.content.clone(),
            rules: policy.policy.ai.keyword_rules.clone(),
            matched_rules: matched_rules.iter().map(|r| r.label()).collect(),
            channel_rules: policy
                .policy
                .channels
                .channel_rules
                .get(&message.channel_id)
                .cloned(),
        };

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(message_id = message.message_id, "Evaluation cancelled");
                return None;
            }
            result = tokio::time::timeout(self.timeout, self.classifier.classify(&request)) => {
                match result {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(e)) => self.degraded(message, e.to_string()),
                    Err(_) => self.degraded(
                        message,
                        format!("classifier timed out after {:?}", self.timeout),
                    ),
                }
            }
        };

        Some(MatchResult {
            matched_rules,
            classifier_verdict: Some(verdict),
        })
    }

    fn degraded(&self, message: &MessageSignal, reason: String) -> Verdict {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: DEGRADED_TARGET,
            guild_id = message.guild_id,
            channel_id = message.channel_id,
            message_id = message.message_id,
            reason = %reason,
            "Classifier unavailable; message passes without action"
        );
        Verdict::Unknown { reason }
    }
}

/// Scam/bot keyword scan. Whitelisted members are never flagged.
pub fn scan_for_scam<'a>(message: &MessageSignal, policy: &'a CompiledPolicy) -> Option<&'a str> {
    let settings = &policy.policy.bot_detection;
    if !settings.enabled || settings.whitelist_users.contains(&message.author_id) {
        return None;
    }
    if message
        .author_role_ids
        .iter()
        .any(|role| settings.whitelist_roles.contains(role))
    {
        return None;
    }
    policy.scam_keyword_hit(&message.content)
}
