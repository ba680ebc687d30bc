// Moderation pipeline - wires detectors, the decision engine, confirmation,
// execution and the case ledger together.
//
// signal -> rate windows / rule evaluator / raid detector
//        -> decision engine
//        -> confirmation (manual actions only)
//        -> action executor -> case ledger
//
// NO Discord dependencies here. The Discord layer turns gateway events into
// signals and calls into this service.

use super::decision_engine::{decide, review_notice, DecisionInput, ReviewNotice};
use super::moderation_models::{
    ActionTarget, CandidateAction, JoinSignal, MessageSignal, ModerationError, SuggestedAction,
    VerificationSignal,
};
use super::rule_evaluator::{scan_for_scam, ContentClassifier, RuleEvaluator};
use crate::core::cases::{
    Appeal, AppealStatus, Case, CaseLedger, CaseStatus, CaseStore, LedgerError, Moderator,
};
use crate::core::confirmation::{ConfirmationCoordinator, ConfirmationState};
use crate::core::enforcement::{
    ActionExecutor, Applied, ExecutionError, ExecutorConfig, Notice, NoticeLevel, NotifyTarget,
    Platform,
};
use crate::core::policy::{ConfirmationMode, GuildPolicy, PolicyService, PolicySnapshot, PolicyStore};
use crate::core::raid::{RaidDetector, RaidStart};
use crate::core::rate_limit::{slowmode_request, ActivityLevel, RateKey, RateKind, RateWindowTracker};
use crate::core::verification::{VerificationOutcome, VerificationService, VerificationToken};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long processed signal ids are remembered for de-duplication.
const SEEN_SIGNAL_TTL_MINUTES: i64 = 60;
/// Join history kept for raid suspicion scoring.
const JOIN_HISTORY_MINUTES: i64 = 10;

const CRISIS_RESOURCES: &str = "If you're going through a hard time, you don't have to face it alone. \
Please reach out to someone you trust or a local crisis line. \
You can find international helplines at https://findahelpline.com.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub classifier_timeout: Duration,
    pub executor: ExecutorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classifier_timeout: Duration::from_secs(10),
            executor: ExecutorConfig::default(),
        }
    }
}

/// What happened to one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Signal already processed.
    Duplicate,
    /// Moderation disabled for the guild or channel.
    Skipped,
    /// The message went away before evaluation finished.
    Cancelled,
    NoAction,
    /// Sent to moderators for review instead of acting.
    Reviewed,
    AwaitingConfirmation(Uuid),
    Rejected(Uuid),
    Executed {
        cases: Vec<Case>,
        failures: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinOutcome {
    pub raid: Option<RaidStart>,
    pub action: Option<PipelineOutcome>,
    pub verification: Option<VerificationToken>,
}

pub struct ModerationPipeline<C, P, PS, CS>
where
    C: ContentClassifier,
    P: Platform + 'static,
    PS: PolicyStore,
    CS: CaseStore,
{
    policies: PolicyService<PS>,
    tracker: Arc<RateWindowTracker>,
    evaluator: RuleEvaluator<C>,
    raids: RaidDetector,
    coordinator: ConfirmationCoordinator<P>,
    executor: ActionExecutor<P, CS>,
    ledger: Arc<CaseLedger<CS>>,
    verification: VerificationService,
    platform: Arc<P>,
    seen_signals: DashMap<String, DateTime<Utc>>,
    // Message ID -> token cancelling its evaluation
    inflight: DashMap<u64, CancellationToken>,
    // Channel ID -> slowmode seconds last applied by us
    last_slowmode: DashMap<u64, u64>,
    // Guild ID -> last message-rate check
    last_rate_check: DashMap<u64, DateTime<Utc>>,
}

impl<C, P, PS, CS> ModerationPipeline<C, P, PS, CS>
where
    C: ContentClassifier,
    P: Platform + 'static,
    PS: PolicyStore,
    CS: CaseStore,
{
    pub fn new(
        classifier: C,
        platform: Arc<P>,
        policy_store: PS,
        case_store: CS,
        config: PipelineConfig,
    ) -> Self {
        let tracker = Arc::new(RateWindowTracker::new());
        let ledger = Arc::new(CaseLedger::new(case_store));
        Self {
            policies: PolicyService::new(policy_store),
            raids: RaidDetector::new(tracker.clone()),
            tracker,
            evaluator: RuleEvaluator::new(classifier, config.classifier_timeout),
            coordinator: ConfirmationCoordinator::new(platform.clone()),
            executor: ActionExecutor::new(platform.clone(), ledger.clone(), config.executor),
            ledger,
            verification: VerificationService::new(),
            platform,
            seen_signals: DashMap::new(),
            inflight: DashMap::new(),
            last_slowmode: DashMap::new(),
            last_rate_check: DashMap::new(),
        }
    }

    pub fn policies(&self) -> &PolicyService<PS> {
        &self.policies
    }

    pub fn ledger(&self) -> &CaseLedger<CS> {
        &self.ledger
    }

    pub fn degraded_events(&self) -> u64 {
        self.evaluator.degraded_events()
    }

    pub fn is_raiding(&self, guild_id: u64) -> bool {
        self.raids.is_raiding(guild_id)
    }

    pub fn confirmation_state(&self, request_id: Uuid) -> Option<ConfirmationState> {
        self.coordinator.state(request_id)
    }

    /// Returns false if the signal was seen before.
    fn mark_seen(&self, source_event_id: String) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.seen_signals.entry(source_event_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    pub async fn handle_message(&self, signal: MessageSignal) -> Result<PipelineOutcome, ModerationError> {
        if !self.mark_seen(signal.source_event_id()) {
            debug!(message_id = signal.message_id, "Duplicate message signal");
            return Ok(PipelineOutcome::Duplicate);
        }

        let snapshot = self.policies.snapshot(signal.guild_id).await?;
        let policy = &snapshot.policy;
        if !policy.general.enabled {
            return Ok(PipelineOutcome::Skipped);
        }

        self.tracker
            .record(RateKey::messages(signal.guild_id, signal.channel_id), signal.timestamp);

        if policy.is_channel_excluded(signal.channel_id) {
            return Ok(PipelineOutcome::Skipped);
        }

        if let Some(keyword) = scan_for_scam(&signal, &snapshot) {
            info!(
                guild_id = signal.guild_id,
                user_id = signal.author_id,
                keyword,
                "Scam keyword detected"
            );
            let input = DecisionInput::ScamDetected {
                signal: &signal,
                keyword,
            };
            return Ok(match decide(input, policy) {
                Some(candidate) => self.dispatch(candidate, policy).await,
                None => PipelineOutcome::NoAction,
            });
        }

        let token = CancellationToken::new();
        self.inflight.insert(signal.message_id, token.clone());
        let evaluated = self.evaluator.evaluate(&signal, &snapshot, &token).await;
        self.inflight.remove(&signal.message_id);

        let Some(result) = evaluated else {
            return Ok(PipelineOutcome::Cancelled);
        };

        if let Some(review) = review_notice(&signal, &result) {
            self.send_review_notice(policy, &review).await;
            return Ok(PipelineOutcome::Reviewed);
        }

        let input = DecisionInput::Message {
            signal: &signal,
            result: &result,
        };
        Ok(match decide(input, policy) {
            Some(candidate) => self.dispatch(candidate, policy).await,
            None => PipelineOutcome::NoAction,
        })
    }

    /// A message was deleted; abandon its evaluation if still running.
    pub fn message_deleted(&self, message_id: u64) {
        if let Some((_, token)) = self.inflight.remove(&message_id) {
            debug!(message_id, "Cancelling evaluation of deleted message");
            token.cancel();
        }
    }

    async fn send_review_notice(&self, policy: &GuildPolicy, review: &ReviewNotice) {
        let urgent = review.suggestion == SuggestedAction::Suicidal;
        if let Some(channel_id) = policy.notice_channel() {
            let title = if urgent {
                "Member may be in crisis"
            } else {
                "Moderator review requested"
            };
            let notice = Notice::new(
                title,
                format!(
                    "Message https://discord.com/channels/{}/{}/{} by <@{}> was flagged.",
                    review.guild_id, review.channel_id, review.message_id, review.author_id
                ),
            )
            .field("Rule", &review.rule_violated)
            .field("Reasoning", &review.reasoning)
            .level(if urgent {
                NoticeLevel::Alert
            } else {
                NoticeLevel::Warning
            })
            .mention(policy.moderation.confirmation_ping_target);
            self.notify(NotifyTarget::Channel(channel_id), &notice).await;
        }

        if urgent {
            let notice = Notice::new("You're not alone", CRISIS_RESOURCES);
            self.notify(NotifyTarget::User(review.author_id), &notice).await;
        }
    }

    // ========================================================================
    // JOINS AND VERIFICATION
    // ========================================================================

    pub async fn handle_join(&self, signal: JoinSignal) -> Result<JoinOutcome, ModerationError> {
        if !self.mark_seen(signal.source_event_id()) {
            return Ok(JoinOutcome::default());
        }

        let snapshot = self.policies.snapshot(signal.guild_id).await?;
        let policy = &snapshot.policy;
        if !policy.general.enabled {
            return Ok(JoinOutcome::default());
        }

        let mut outcome = JoinOutcome::default();

        if let Some(raid) = self.raids.observe_join(&signal, &policy.raid_defense) {
            self.send_raid_alert(policy, &raid).await;
            if let Some(candidate) = decide(DecisionInput::Raid(&raid), policy) {
                outcome.action = Some(self.dispatch(candidate, policy).await);
            }
            outcome.raid = Some(raid);
        }

        if policy.verification.enabled {
            let token = self
                .verification
                .issue(signal.guild_id, signal.user_id, signal.joined_at);
            let notice = Notice::new(
                "Verification required",
                format!(
                    "Use `/verify {}` in the server within 10 minutes to finish joining.",
                    token.token
                ),
            )
            .field("Attempts allowed", policy.verification.max_attempts);
            self.notify(NotifyTarget::User(signal.user_id), &notice).await;
            outcome.verification = Some(token);
        }

        Ok(outcome)
    }

    async fn send_raid_alert(&self, policy: &GuildPolicy, raid: &RaidStart) {
        let Some(channel_id) = policy.raid_defense.alert_channel.or(policy.notice_channel()) else {
            return;
        };
        let notice = Notice::new(
            "Raid detected",
            format!(
                "{} members joined within {} seconds.",
                raid.join_count, policy.raid_defense.join_timeframe_seconds
            ),
        )
        .field("Automatic action", format!("{:?}", raid.auto_action))
        .field("Suspicious accounts", raid.suspicious_users.len())
        .level(NoticeLevel::Alert)
        .mention(policy.moderation.confirmation_ping_target);
        self.notify(NotifyTarget::Channel(channel_id), &notice).await;
    }

    pub async fn handle_verification(
        &self,
        signal: VerificationSignal,
    ) -> Result<(VerificationOutcome, Option<PipelineOutcome>), ModerationError> {
        let snapshot = self.policies.snapshot(signal.guild_id).await?;
        let policy = &snapshot.policy;
        if !policy.verification.enabled {
            return Err(ModerationError::InvalidRequest(
                "verification is not enabled in this server".to_string(),
            ));
        }

        let outcome = self
            .verification
            .redeem(&signal, policy.verification.max_attempts)
            .map_err(|e| ModerationError::InvalidRequest(e.to_string()))?;

        let action = match outcome.as_decision_input().and_then(|input| decide(input, policy)) {
            Some(candidate) => Some(self.dispatch(candidate, policy).await),
            None => None,
        };
        Ok((outcome, action))
    }

    // ========================================================================
    // PERIODIC MONITOR
    // ========================================================================

    /// Message-rate checks, raid expiry and housekeeping. Call periodically.
    pub async fn run_monitor_tick(&self, now: DateTime<Utc>) {
        let mut channels_by_guild: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for key in self.tracker.tracked_keys(RateKind::Message) {
            if let Some(channel_id) = key.channel_id {
                channels_by_guild.entry(key.guild_id).or_default().push(channel_id);
            }
        }

        for (guild_id, channels) in channels_by_guild {
            let snapshot = match self.policies.snapshot(guild_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(guild_id, error = %e, "Skipping rate check; policy unavailable");
                    continue;
                }
            };
            self.check_message_rates(&snapshot, channels, now).await;
        }

        for guild_id in self.raids.active_guilds() {
            if let Ok(snapshot) = self.policies.snapshot(guild_id).await {
                self.raids.tick(guild_id, &snapshot.policy.raid_defense, now);
            }
        }

        self.tracker.sweep(now);
        self.raids
            .sweep(now - ChronoDuration::minutes(JOIN_HISTORY_MINUTES));
        self.verification.sweep(now);
        self.coordinator.prune_resolved(now);
        let seen_cutoff = now - ChronoDuration::minutes(SEEN_SIGNAL_TTL_MINUTES);
        self.seen_signals.retain(|_, seen_at| *seen_at > seen_cutoff);
    }

    /// Slowmode currently set on the channel, for channels we have not
    /// touched since startup. Remembered so later ticks skip the lookup.
    async fn observed_slowmode(&self, guild_id: u64, channel_id: u64) -> Option<u64> {
        match self.platform.current_slowmode(channel_id).await {
            Ok(Some(seconds)) => {
                self.last_slowmode.insert(channel_id, seconds);
                Some(seconds)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(guild_id, channel_id, error = %e, "Could not read current slowmode");
                None
            }
        }
    }

    async fn check_message_rates(&self, snapshot: &PolicySnapshot, channels: Vec<u64>, now: DateTime<Utc>) {
        let policy = &snapshot.policy;
        let settings = &policy.message_rate;
        let guild_id = policy.guild_id;
        if !policy.general.enabled || !settings.enabled {
            return;
        }

        let interval = ChronoDuration::seconds(settings.check_interval_seconds as i64);
        if let Some(last) = self.last_rate_check.get(&guild_id).map(|t| *t) {
            if now - last < interval {
                return;
            }
        }
        self.last_rate_check.insert(guild_id, now);

        let window = Duration::from_secs(settings.analysis_window_seconds);
        for channel_id in channels {
            if !settings.covers_channel(channel_id) || policy.is_channel_excluded(channel_id) {
                continue;
            }

            let rate = self
                .tracker
                .rate_at(RateKey::messages(guild_id, channel_id), window, now);
            let Some(requested) = slowmode_request(rate, settings) else {
                continue;
            };
            let previous = match self.last_slowmode.get(&channel_id).map(|s| *s) {
                Some(seconds) => Some(seconds),
                None => self.observed_slowmode(guild_id, channel_id).await,
            };
            let input = DecisionInput::RateCross {
                guild_id,
                channel_id,
                rate,
                requested_seconds: requested,
                last_applied_seconds: previous,
                checked_at: now,
            };
            let Some(candidate) = decide(input, policy) else {
                continue;
            };

            let outcome = self.dispatch(candidate, policy).await;
            let accepted = match &outcome {
                PipelineOutcome::Executed { cases, .. } => !cases.is_empty(),
                PipelineOutcome::AwaitingConfirmation(_) => true,
                _ => false,
            };
            if !accepted {
                continue;
            }
            self.last_slowmode.insert(channel_id, requested);
            info!(guild_id, channel_id, rate, slowmode = requested, "Slowmode adjusted");

            if settings.notifications_enabled {
                let level = ActivityLevel::classify(rate, settings);
                let notice = Notice::new(
                    "Slowmode updated",
                    format!("{} activity in <#{}>.", level, channel_id),
                )
                .field("Messages", format!("{} in {}s", rate, settings.analysis_window_seconds))
                .field(
                    "Slowmode",
                    format!(
                        "{}s -> {}s",
                        previous.map_or_else(|| "?".to_string(), |p| p.to_string()),
                        requested
                    ),
                );
                let target = settings.notification_channel.unwrap_or(channel_id);
                self.notify(NotifyTarget::Channel(target), &notice).await;
            }
        }
    }

    // ========================================================================
    // CONFIRMATION / EXECUTION
    // ========================================================================

    async fn dispatch(&self, candidate: CandidateAction, policy: &GuildPolicy) -> PipelineOutcome {
        if policy.confirmation_mode(candidate.action_type) == ConfirmationMode::Manual {
            let request = self.coordinator.submit(candidate, policy).await;
            return PipelineOutcome::AwaitingConfirmation(request.request_id);
        }
        self.execute(candidate, Moderator::System, policy).await
    }

    async fn execute(
        &self,
        candidate: CandidateAction,
        moderator: Moderator,
        policy: &GuildPolicy,
    ) -> PipelineOutcome {
        let mut cases = Vec::new();
        let mut failures = Vec::new();

        for (single, result) in self.executor.apply_all(candidate, moderator).await {
            match result {
                Ok(Applied::New(case)) => {
                    self.send_case_notice(policy, &case).await;
                    cases.push(case);
                }
                Ok(Applied::AlreadyApplied(case)) => cases.push(case),
                Err(e) => {
                    self.report_failure(policy, &single, &e).await;
                    failures.push(e.to_string());
                }
            }
        }

        PipelineOutcome::Executed { cases, failures }
    }

    /// Resolve a confirmation request from a moderator's button press.
    pub async fn resolve_confirmation(
        &self,
        guild_id: u64,
        request_id: Uuid,
        moderator_id: u64,
        approve: bool,
    ) -> Result<PipelineOutcome, ModerationError> {
        match self.coordinator.request(request_id) {
            Some(request) if request.candidate.guild_id == guild_id => {}
            _ => {
                return Err(ModerationError::NotFound(format!(
                    "confirmation request {}",
                    request_id
                )))
            }
        }

        if !approve {
            self.coordinator.reject(request_id, moderator_id)?;
            return Ok(PipelineOutcome::Rejected(request_id));
        }

        let candidate = self.coordinator.approve(request_id, moderator_id)?;
        let snapshot = self.policies.snapshot(guild_id).await?;
        Ok(self
            .execute(candidate, Moderator::User(moderator_id), &snapshot.policy)
            .await)
    }

    async fn send_case_notice(&self, policy: &GuildPolicy, case: &Case) {
        let Some(channel_id) = policy.moderation.mod_log_channel.or(policy.logging.log_channel) else {
            return;
        };
        let target = if case.target_user_id == 0 {
            case.channel_id
                .map_or_else(|| "server".to_string(), |c| format!("<#{}>", c))
        } else {
            format!("<@{}>", case.target_user_id)
        };
        let moderator = match case.moderator {
            Moderator::System => "Automod".to_string(),
            Moderator::User(id) => format!("<@{}>", id),
        };

        let mut notice = Notice::new(
            format!("Case #{} | {}", case.case_id, case.action_type),
            case.reason.clone(),
        )
        .field("Target", target)
        .field("Moderator", moderator);
        if let Some(rule) = &case.rule_violated {
            notice = notice.field("Rule", rule);
        }
        if let Some(duration) = case.duration_seconds {
            notice = notice.field("Duration", format!("{}s", duration));
        }
        self.notify(NotifyTarget::Channel(channel_id), &notice).await;
    }

    async fn report_failure(&self, policy: &GuildPolicy, candidate: &CandidateAction, e: &ExecutionError) {
        error!(
            guild_id = candidate.guild_id,
            action = %candidate.action_type,
            target = ?candidate.target,
            source_event_id = %candidate.source_event_id,
            error = %e,
            "Moderation action failed"
        );

        let Some(channel_id) = policy.error_channel() else {
            return;
        };
        let target = match &candidate.target {
            ActionTarget::User(id) => format!("<@{}>", id),
            other => format!("{:?}", other),
        };
        let title = if e.is_permission() {
            "Missing permissions"
        } else if matches!(e, ExecutionError::Unrecorded { .. }) {
            "Action applied without a case"
        } else {
            "Moderation action failed"
        };
        let notice = Notice::new(title, e.to_string())
            .field("Guild", candidate.guild_id)
            .field("Action", candidate.action_type)
            .field("Target", target)
            .field("Reason", &candidate.reason)
            .field("Source", &candidate.source_event_id)
            .level(NoticeLevel::Alert);
        self.notify(NotifyTarget::Channel(channel_id), &notice).await;
    }

    async fn notify(&self, target: NotifyTarget, notice: &Notice) {
        if let Err(e) = self.platform.notify(target, notice).await {
            warn!(?target, error = %e, "Failed to deliver notice");
        }
    }

    // ========================================================================
    // APPEALS AND CASE QUERIES
    // ========================================================================

    pub async fn submit_appeal(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: String,
    ) -> Result<Appeal, ModerationError> {
        let appeal = self
            .ledger
            .submit_appeal(guild_id, user_id, reason, Utc::now())
            .await?;

        let snapshot = self.policies.snapshot(guild_id).await?;
        if let Some(channel_id) = snapshot.policy.notice_channel() {
            let notice = Notice::new(
                "New appeal",
                format!(
                    "<@{}> appealed case #{} ({}).",
                    user_id, appeal.original_case.case_id, appeal.original_case.action_type
                ),
            )
            .field("Appeal", appeal.appeal_id)
            .field("Reason", &appeal.reason);
            self.notify(NotifyTarget::Channel(channel_id), &notice).await;
        }
        Ok(appeal)
    }

    /// Approve or deny an appeal. Approval lifts the punishment.
    pub async fn resolve_appeal(
        &self,
        guild_id: u64,
        appeal_id: Uuid,
        status: AppealStatus,
        moderator_id: u64,
    ) -> Result<Appeal, ModerationError> {
        let appeal = self.ledger.get_appeal(appeal_id).await?;
        if appeal.guild_id != guild_id {
            return Err(ModerationError::NotFound(format!("appeal {}", appeal_id)));
        }

        if appeal.status != AppealStatus::Pending {
            return Err(LedgerError::AppealAlreadyResolved(appeal_id).into());
        }

        // Lift the punishment before recording the approval; a failed revert
        // leaves the appeal pending so it can be approved again.
        if status == AppealStatus::Approved {
            let live = self
                .ledger
                .get_case(guild_id, appeal.original_case.case_id)
                .await?;
            if live.status == CaseStatus::Reverted {
                debug!(guild_id, case_id = live.case_id, "Case already reverted");
            } else if let Err(e) = self.executor.revert(&live).await {
                let snapshot = self.policies.snapshot(guild_id).await?;
                let candidate = CandidateAction {
                    source_event_id: format!("appeal:{}", appeal_id),
                    guild_id,
                    target: ActionTarget::User(live.target_user_id),
                    action_type: live.action_type,
                    duration_seconds: None,
                    reason: "Reverting after approved appeal".to_string(),
                    rule_violated: None,
                    channel_id: None,
                    message_id: None,
                };
                self.report_failure(&snapshot.policy, &candidate, &e).await;
                return Err(e.into());
            }
        }

        let resolved = self
            .ledger
            .resolve_appeal(appeal_id, status, Utc::now())
            .await?;
        info!(guild_id, %appeal_id, moderator_id, %status, "Appeal resolved by moderator");

        let notice = Notice::new(
            format!("Your appeal was {}", status),
            format!(
                "Appeal for case #{} ({}).",
                resolved.original_case.case_id, resolved.original_case.action_type
            ),
        );
        self.notify(NotifyTarget::User(resolved.target_user_id), &notice).await;
        Ok(resolved)
    }

    pub async fn get_case(&self, guild_id: u64, case_id: u64) -> Result<Case, ModerationError> {
        Ok(self.ledger.get_case(guild_id, case_id).await?)
    }

    pub async fn user_history(&self, guild_id: u64, user_id: u64, limit: u32) -> Result<Vec<Case>, ModerationError> {
        Ok(self.ledger.list_user_cases(guild_id, user_id, limit).await?)
    }

    pub async fn pending_appeals(&self, guild_id: u64) -> Result<Vec<Appeal>, ModerationError> {
        Ok(self
            .ledger
            .list_appeals(guild_id, Some(AppealStatus::Pending))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enforcement::mock_platform::{MockPlatform, PlatformCall};
    use crate::core::enforcement::PlatformError;
    use crate::core::moderation::{
        ActionType, ClassificationRequest, ClassifierError, Verdict, VerdictSource,
    };
    use crate::core::policy::{MessageRateSettings, PolicySection, RaidAutoAction};
    use crate::infra::cases::InMemoryCaseStore;
    use crate::infra::policy::InMemoryPolicyStore;
    use async_trait::async_trait;

    /// Classifier answering from a fixed script keyed by message content.
    #[derive(Default)]
    struct ScriptedClassifier {
        verdicts: DashMap<String, Verdict>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ContentClassifier for ScriptedClassifier {
        async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .verdicts
                .get(&request.content)
                .map(|v| v.clone())
                .unwrap_or(Verdict::Clean {
                    reasoning: "fine".to_string(),
                }))
        }
    }

    type TestPipeline =
        ModerationPipeline<ScriptedClassifier, MockPlatform, InMemoryPolicyStore, InMemoryCaseStore>;

    const GUILD: u64 = 1;
    const MOD_LOG: u64 = 900;
    const ERRORS: u64 = 901;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn base_policy() -> GuildPolicy {
        let mut policy = GuildPolicy::default_for(GUILD);
        policy.moderation.mod_log_channel = Some(MOD_LOG);
        policy.moderation.error_notification_target = Some(ERRORS);
        policy.moderation.confirmation_ping_target = Some(77);
        policy
    }

    async fn pipeline_with(
        classifier: ScriptedClassifier,
        platform: MockPlatform,
        policy: GuildPolicy,
    ) -> (TestPipeline, Arc<MockPlatform>) {
        let platform = Arc::new(platform);
        let config = PipelineConfig {
            classifier_timeout: Duration::from_secs(2),
            executor: ExecutorConfig {
                max_attempts: 2,
                ..Default::default()
            },
        };
        let pipeline = ModerationPipeline::new(
            classifier,
            platform.clone(),
            InMemoryPolicyStore::new(),
            InMemoryCaseStore::new(),
            config,
        );
        pipeline.policies().save(&policy).await.unwrap();
        (pipeline, platform)
    }

    fn flagging(content: &str, suggested: SuggestedAction) -> ScriptedClassifier {
        let classifier = ScriptedClassifier::default();
        classifier.verdicts.insert(
            content.to_string(),
            Verdict::Violation {
                rule_violated: "Be kind".to_string(),
                reasoning: "insult".to_string(),
                suggested,
                source: VerdictSource::Classifier,
            },
        );
        classifier
    }

    fn message(id: u64, channel_id: u64, content: &str, secs: i64) -> MessageSignal {
        MessageSignal {
            message_id: id,
            guild_id: GUILD,
            channel_id,
            author_id: 7,
            author_name: "someone".to_string(),
            author_role_ids: vec![],
            content: content.to_string(),
            timestamp: at(secs),
        }
    }

    fn join(user_id: u64, secs: i64) -> JoinSignal {
        JoinSignal {
            guild_id: GUILD,
            user_id,
            account_created_at: at(secs) - ChronoDuration::hours(1),
            joined_at: at(secs),
        }
    }

    fn punishments(platform: &MockPlatform) -> Vec<PlatformCall> {
        platform
            .enforcement_calls()
            .into_iter()
            .filter(|c| matches!(c, PlatformCall::Punish { .. }))
            .collect()
    }

    #[tokio::test]
    async fn violation_is_applied_and_logged() {
        let (pipeline, platform) = pipeline_with(
            flagging("you idiot", SuggestedAction::TimeoutShort),
            MockPlatform::new(),
            base_policy(),
        )
        .await;

        let outcome = pipeline.handle_message(message(1, 10, "you idiot", 0)).await.unwrap();

        let PipelineOutcome::Executed { cases, failures } = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert!(failures.is_empty());
        assert_eq!(cases[0].action_type, ActionType::Timeout);
        assert_eq!(cases[0].duration_seconds, Some(600));
        assert_eq!(
            punishments(&platform),
            vec![PlatformCall::Punish {
                guild_id: GUILD,
                user_id: 7,
                action: ActionType::Timeout,
                duration_seconds: Some(600)
            }]
        );
        assert!(platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::Channel(MOD_LOG) && n.title.starts_with("Case #1")));
    }

    #[tokio::test]
    async fn redelivered_message_is_deduplicated() {
        let (pipeline, platform) = pipeline_with(
            flagging("you idiot", SuggestedAction::Ban),
            MockPlatform::new(),
            base_policy(),
        )
        .await;

        pipeline.handle_message(message(1, 10, "you idiot", 0)).await.unwrap();
        let again = pipeline.handle_message(message(1, 10, "you idiot", 0)).await.unwrap();

        assert_eq!(again, PipelineOutcome::Duplicate);
        assert_eq!(punishments(&platform).len(), 1);
        assert_eq!(pipeline.ledger().list_recent_cases(GUILD, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_action_waits_for_approval() {
        let mut policy = base_policy();
        policy
            .moderation
            .action_confirmation
            .insert(ActionType::Ban, ConfirmationMode::Manual);
        let (pipeline, platform) = pipeline_with(
            flagging("raid time", SuggestedAction::Ban),
            MockPlatform::new(),
            policy,
        )
        .await;

        let outcome = pipeline.handle_message(message(1, 10, "raid time", 0)).await.unwrap();
        let PipelineOutcome::AwaitingConfirmation(request_id) = outcome else {
            panic!("expected confirmation, got {:?}", outcome);
        };
        assert!(punishments(&platform).is_empty());

        let approved = pipeline
            .resolve_confirmation(GUILD, request_id, 42, true)
            .await
            .unwrap();
        let PipelineOutcome::Executed { cases, .. } = approved else {
            panic!("expected execution");
        };
        assert_eq!(cases[0].moderator, Moderator::User(42));

        assert!(pipeline
            .resolve_confirmation(GUILD, request_id, 43, true)
            .await
            .is_err());
        assert_eq!(punishments(&platform).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_sends_everything_to_confirmation() {
        let mut policy = base_policy();
        policy.general.test_mode = true;
        let (pipeline, platform) = pipeline_with(
            flagging("meh", SuggestedAction::Warn),
            MockPlatform::new(),
            policy,
        )
        .await;

        let outcome = pipeline.handle_message(message(1, 10, "meh", 0)).await.unwrap();
        let PipelineOutcome::AwaitingConfirmation(request_id) = outcome else {
            panic!("expected confirmation, got {:?}", outcome);
        };

        let rejected = pipeline
            .resolve_confirmation(GUILD, request_id, 42, false)
            .await
            .unwrap();
        assert_eq!(rejected, PipelineOutcome::Rejected(request_id));
        assert!(punishments(&platform).is_empty());
        assert_eq!(
            pipeline.confirmation_state(request_id),
            Some(ConfirmationState::Rejected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_timeout_takes_no_action() {
        let mut classifier = flagging("slow", SuggestedAction::Ban);
        classifier.delay = Some(Duration::from_secs(30));
        let (pipeline, platform) = pipeline_with(classifier, MockPlatform::new(), base_policy()).await;

        let outcome = pipeline.handle_message(message(1, 10, "slow", 0)).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::NoAction);
        assert_eq!(pipeline.degraded_events(), 1);
        assert!(platform.enforcement_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_message_cancels_its_evaluation() {
        let mut classifier = flagging("slow", SuggestedAction::Ban);
        classifier.delay = Some(Duration::from_secs(1));
        let (pipeline, platform) = pipeline_with(classifier, MockPlatform::new(), base_policy()).await;
        let pipeline = Arc::new(pipeline);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle_message(message(5, 10, "slow", 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.message_deleted(5);

        assert_eq!(task.await.unwrap().unwrap(), PipelineOutcome::Cancelled);
        assert!(platform.enforcement_calls().is_empty());
    }

    #[tokio::test]
    async fn excluded_channels_and_disabled_guilds_are_skipped() {
        let mut policy = base_policy();
        policy.channels.excluded_channels = vec![11];
        let (pipeline, _platform) =
            pipeline_with(flagging("bad", SuggestedAction::Ban), MockPlatform::new(), policy).await;

        let outcome = pipeline.handle_message(message(1, 11, "bad", 0)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped);

        let mut disabled = base_policy();
        disabled.general.enabled = false;
        pipeline.policies().save(&disabled).await.unwrap();
        let outcome = pipeline.handle_message(message(2, 10, "bad", 0)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped);
    }

    #[tokio::test]
    async fn notify_mods_verdict_is_reviewed_not_punished() {
        let (pipeline, platform) = pipeline_with(
            flagging("hmm", SuggestedAction::NotifyMods),
            MockPlatform::new(),
            base_policy(),
        )
        .await;

        let outcome = pipeline.handle_message(message(1, 10, "hmm", 0)).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Reviewed);
        assert!(platform.enforcement_calls().is_empty());
        assert!(platform
            .notices()
            .iter()
            .any(|(_, n)| n.title == "Moderator review requested"));
    }

    #[tokio::test]
    async fn scam_keywords_bypass_the_classifier() {
        let mut policy = base_policy();
        policy.bot_detection.enabled = true;
        policy.bot_detection.action = ActionType::Kick;
        // The classifier would ask for a ban; the scam path must win without asking it.
        let (pipeline, platform) = pipeline_with(
            flagging("FREE NITRO at this link", SuggestedAction::Ban),
            MockPlatform::new(),
            policy,
        )
        .await;

        let outcome = pipeline
            .handle_message(message(1, 10, "FREE NITRO at this link", 0))
            .await
            .unwrap();

        let PipelineOutcome::Executed { cases, .. } = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert_eq!(cases[0].action_type, ActionType::Kick);
        assert_eq!(cases[0].rule_violated.as_deref(), Some("Scam / bot detection"));
        assert_eq!(punishments(&platform).len(), 1);
    }

    #[tokio::test]
    async fn permission_failure_is_reported_to_error_channel() {
        let (pipeline, platform) = pipeline_with(
            flagging("bad", SuggestedAction::Kick),
            MockPlatform::always_failing(PlatformError::Permission("Kick Members".to_string())),
            base_policy(),
        )
        .await;

        let outcome = pipeline.handle_message(message(1, 10, "bad", 0)).await.unwrap();

        let PipelineOutcome::Executed { cases, failures } = outcome else {
            panic!("expected execution attempt");
        };
        assert!(cases.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(platform.enforcement_calls().len(), 1);
        assert!(platform.notices().iter().any(|(t, n)| {
            *t == NotifyTarget::Channel(ERRORS) && n.title == "Missing permissions"
        }));
    }

    #[tokio::test]
    async fn raid_triggers_one_lockdown() {
        let mut policy = base_policy();
        policy.raid_defense.enabled = true;
        policy.raid_defense.auto_action = RaidAutoAction::Lockdown;
        policy.raid_defense.alert_channel = Some(555);
        let (pipeline, platform) =
            pipeline_with(ScriptedClassifier::default(), MockPlatform::new(), policy).await;

        let mut raids = 0;
        for i in 0..15 {
            let outcome = pipeline.handle_join(join(100 + i, i as i64)).await.unwrap();
            if outcome.raid.is_some() {
                raids += 1;
                assert!(matches!(outcome.action, Some(PipelineOutcome::Executed { .. })));
            }
        }

        assert_eq!(raids, 1);
        assert!(pipeline.is_raiding(GUILD));
        assert_eq!(
            platform.enforcement_calls(),
            vec![PlatformCall::Lockdown { guild_id: GUILD }]
        );
        assert!(platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::Channel(555) && n.title == "Raid detected"));
    }

    #[tokio::test]
    async fn degenerate_stored_raid_settings_do_not_lock_down() {
        let store = InMemoryPolicyStore::new();
        store
            .save_section(
                GUILD,
                PolicySection::RaidDefense,
                serde_json::json!({
                    "enabled": true,
                    "auto_action": "lockdown",
                    "join_threshold": 0,
                    "join_timeframe_seconds": 0
                }),
            )
            .await
            .unwrap();
        let platform = Arc::new(MockPlatform::new());
        let pipeline = ModerationPipeline::new(
            ScriptedClassifier::default(),
            platform.clone(),
            store,
            InMemoryCaseStore::new(),
            PipelineConfig::default(),
        );

        let outcome = pipeline.handle_join(join(100, 0)).await.unwrap();

        assert!(outcome.raid.is_none());
        assert!(!pipeline.is_raiding(GUILD));
        assert!(platform.enforcement_calls().is_empty());
    }

    #[tokio::test]
    async fn ban_new_targets_each_young_account_once() {
        let mut policy = base_policy();
        policy.raid_defense.enabled = true;
        policy.raid_defense.auto_action = RaidAutoAction::BanNew;
        let (pipeline, platform) =
            pipeline_with(ScriptedClassifier::default(), MockPlatform::new(), policy).await;

        for i in 0..10 {
            pipeline.handle_join(join(100 + i, i as i64)).await.unwrap();
        }

        assert_eq!(punishments(&platform).len(), 10);
        let cases = pipeline.ledger().list_recent_cases(GUILD, 20).await.unwrap();
        assert_eq!(cases.len(), 10);
        assert!(cases.iter().all(|c| c.action_type == ActionType::Ban));
    }

    #[tokio::test]
    async fn slowmode_follows_hysteresis_without_repeats() {
        let mut policy = base_policy();
        policy.message_rate = MessageRateSettings {
            enabled: true,
            notifications_enabled: true,
            ..Default::default()
        };
        let (pipeline, platform) =
            pipeline_with(ScriptedClassifier::default(), MockPlatform::new(), policy).await;

        let slowmodes = |platform: &MockPlatform| -> Vec<u64> {
            platform
                .enforcement_calls()
                .into_iter()
                .filter_map(|c| match c {
                    PlatformCall::Slowmode { seconds, .. } => Some(seconds),
                    _ => None,
                })
                .collect()
        };

        // 12 messages inside the window: high activity.
        for i in 0..12 {
            pipeline.handle_message(message(i, 10, "hi", i as i64)).await.unwrap();
        }
        pipeline.run_monitor_tick(at(20)).await;
        assert_eq!(slowmodes(&platform), vec![5]);

        // Still busy on the next check: no repeat.
        pipeline.run_monitor_tick(at(50)).await;
        assert_eq!(slowmodes(&platform), vec![5]);

        // 6 messages in the window: between thresholds, nothing.
        for i in 0..6 {
            pipeline.handle_message(message(100 + i, 10, "hi", 100 + i as i64)).await.unwrap();
        }
        pipeline.run_monitor_tick(at(110)).await;
        assert_eq!(slowmodes(&platform), vec![5]);

        // Only 2 messages in the window: low activity.
        for i in 0..2 {
            pipeline.handle_message(message(200 + i, 10, "hi", 200 + i as i64)).await.unwrap();
        }
        pipeline.run_monitor_tick(at(210)).await;
        assert_eq!(slowmodes(&platform), vec![5, 2]);

        assert!(platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::Channel(10) && n.title == "Slowmode updated"));
    }

    #[tokio::test]
    async fn slowmode_set_before_startup_is_not_reapplied() {
        let mut policy = base_policy();
        policy.message_rate = MessageRateSettings {
            enabled: true,
            notifications_enabled: true,
            ..Default::default()
        };
        let platform = MockPlatform::new();
        platform.set_current_slowmode(10, 2);
        let (pipeline, platform) =
            pipeline_with(ScriptedClassifier::default(), platform, policy).await;

        // Quiet channel already at the low-activity slowmode.
        for i in 0..2 {
            pipeline.handle_message(message(i, 10, "hi", i as i64)).await.unwrap();
        }
        pipeline.run_monitor_tick(at(20)).await;

        assert!(platform.enforcement_calls().is_empty());
        assert!(!platform
            .notices()
            .iter()
            .any(|(_, n)| n.title == "Slowmode updated"));

        // A busy burst still raises it.
        for i in 0..12 {
            pipeline.handle_message(message(100 + i, 10, "hi", 100 + i as i64)).await.unwrap();
        }
        pipeline.run_monitor_tick(at(120)).await;
        assert_eq!(
            platform.enforcement_calls(),
            vec![PlatformCall::Slowmode {
                channel_id: 10,
                seconds: 5
            }]
        );
    }

    #[tokio::test]
    async fn failed_revert_leaves_appeal_pending() {
        let (pipeline, platform) = pipeline_with(
            flagging("bad", SuggestedAction::Ban),
            MockPlatform::new(),
            base_policy(),
        )
        .await;
        pipeline.handle_message(message(1, 10, "bad", 0)).await.unwrap();
        let appeal = pipeline
            .submit_appeal(GUILD, 7, "it was a joke".to_string())
            .await
            .unwrap();

        platform.fail_next(PlatformError::Permission("Ban Members".to_string()));
        let result = pipeline
            .resolve_appeal(GUILD, appeal.appeal_id, AppealStatus::Approved, 42)
            .await;

        assert!(matches!(result, Err(ModerationError::Permission(_))));
        let pending = pipeline.pending_appeals(GUILD).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, AppealStatus::Pending);
        let live = pipeline.get_case(GUILD, appeal.original_case.case_id).await.unwrap();
        assert_eq!(live.status, CaseStatus::Applied);
        assert!(platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::Channel(ERRORS) && n.title == "Missing permissions"));
        assert!(!platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::User(7) && n.title.starts_with("Your appeal was")));

        // Once the bot can unban again, approving goes through.
        let resolved = pipeline
            .resolve_appeal(GUILD, appeal.appeal_id, AppealStatus::Approved, 42)
            .await
            .unwrap();
        assert_eq!(resolved.status, AppealStatus::Approved);
        let live = pipeline.get_case(GUILD, appeal.original_case.case_id).await.unwrap();
        assert_eq!(live.status, CaseStatus::Reverted);
        assert!(platform
            .notices()
            .iter()
            .any(|(t, n)| *t == NotifyTarget::User(7) && n.title == "Your appeal was approved"));
    }

    #[tokio::test]
    async fn approved_appeal_lifts_ban_and_keeps_snapshot() {
        let (pipeline, platform) = pipeline_with(
            flagging("bad", SuggestedAction::Ban),
            MockPlatform::new(),
            base_policy(),
        )
        .await;
        pipeline.handle_message(message(1, 10, "bad", 0)).await.unwrap();

        let appeal = pipeline
            .submit_appeal(GUILD, 7, "it was a joke".to_string())
            .await
            .unwrap();
        assert_eq!(pipeline.pending_appeals(GUILD).await.unwrap().len(), 1);

        let resolved = pipeline
            .resolve_appeal(GUILD, appeal.appeal_id, AppealStatus::Approved, 42)
            .await
            .unwrap();

        assert_eq!(resolved.status, AppealStatus::Approved);
        assert_eq!(resolved.original_case, appeal.original_case);
        assert!(platform.enforcement_calls().contains(&PlatformCall::Revoke {
            guild_id: GUILD,
            user_id: 7,
            action: ActionType::Ban
        }));
        let live = pipeline.get_case(GUILD, appeal.original_case.case_id).await.unwrap();
        assert_eq!(live.status, CaseStatus::Reverted);

        let stored = pipeline.ledger().get_appeal(appeal.appeal_id).await.unwrap();
        assert_eq!(stored.original_case.status, CaseStatus::Applied);
        assert!(pipeline.pending_appeals(GUILD).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verification_failure_kicks_after_max_attempts() {
        let mut policy = base_policy();
        policy.verification.enabled = true;
        policy.verification.max_attempts = 2;
        let (pipeline, platform) =
            pipeline_with(ScriptedClassifier::default(), MockPlatform::new(), policy).await;

        let joined = pipeline.handle_join(join(8, 0)).await.unwrap();
        assert!(joined.verification.is_some());

        let wrong = |secs| VerificationSignal {
            guild_id: GUILD,
            user_id: 8,
            token: "wrong".to_string(),
            submitted_at: at(secs),
        };
        let (first, action) = pipeline.handle_verification(wrong(5)).await.unwrap();
        assert_eq!(first, VerificationOutcome::Retry { remaining_attempts: 1 });
        assert!(action.is_none());

        let (second, action) = pipeline.handle_verification(wrong(6)).await.unwrap();
        assert!(matches!(second, VerificationOutcome::Failed(_)));
        assert!(matches!(action, Some(PipelineOutcome::Executed { .. })));
        assert_eq!(
            punishments(&platform),
            vec![PlatformCall::Punish {
                guild_id: GUILD,
                user_id: 8,
                action: ActionType::Kick,
                duration_seconds: None
            }]
        );
    }
}
