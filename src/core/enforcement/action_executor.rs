// Action executor - applies a candidate action on the platform and records
// the case.
//
// Guarantees:
// - one case per (guild, source event, action type); re-applying is a no-op
// - per-(guild, target) serialization, so a ban never races a kick
// - transient failures are retried with exponential backoff
// - permission failures are returned immediately, never retried

use super::platform::{Platform, PlatformError};
use crate::core::cases::{Case, CaseLedger, CaseStore, LedgerError, Moderator, NewCase};
use crate::core::moderation::{ActionTarget, ActionType, CandidateAction, ModerationError};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on every single platform call.
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Missing permission for {action}: {message}")]
    Permission { action: ActionType, message: String },

    #[error("Gave up on {action} after {attempts} attempts: {last_error}")]
    Exhausted {
        action: ActionType,
        attempts: u32,
        last_error: PlatformError,
    },

    #[error("Platform rejected {action}: {error}")]
    Platform { action: ActionType, error: PlatformError },

    #[error("{action} cannot target {target:?}")]
    InvalidTarget { action: ActionType, target: ActionTarget },

    /// The platform call went through but no case could be written.
    #[error("{action} was applied but its case could not be recorded: {message}")]
    Unrecorded { action: ActionType, message: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ExecutionError {
    pub fn is_permission(&self) -> bool {
        matches!(self, ExecutionError::Permission { .. })
    }
}

impl From<ExecutionError> for ModerationError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Permission { .. } => ModerationError::Permission(e.to_string()),
            ExecutionError::Exhausted { .. } => ModerationError::TransientPlatform(e.to_string()),
            ExecutionError::Unrecorded { .. } => ModerationError::Storage(e.to_string()),
            ExecutionError::Ledger(inner) => inner.into(),
            other => ModerationError::InvalidRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    New(Case),
    /// Already applied earlier for the same source event; nothing was done.
    AlreadyApplied(Case),
}

impl Applied {
    pub fn case(&self) -> &Case {
        match self {
            Applied::New(case) | Applied::AlreadyApplied(case) => case,
        }
    }
}

type LockKey = (u64, u64);

pub struct ActionExecutor<P: Platform, S: CaseStore> {
    platform: Arc<P>,
    ledger: Arc<CaseLedger<S>>,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
    config: ExecutorConfig,
}

impl<P: Platform, S: CaseStore> ActionExecutor<P, S> {
    pub fn new(platform: Arc<P>, ledger: Arc<CaseLedger<S>>, config: ExecutorConfig) -> Self {
        Self {
            platform,
            ledger,
            locks: DashMap::new(),
            config,
        }
    }

    /// Apply every target of a candidate, one case per target.
    pub async fn apply_all(
        &self,
        candidate: CandidateAction,
        moderator: Moderator,
    ) -> Vec<(CandidateAction, Result<Applied, ExecutionError>)> {
        let mut results = Vec::new();
        for single in candidate.split_targets() {
            let result = self.apply(&single, moderator).await;
            results.push((single, result));
        }
        results
    }

    /// Apply one single-target candidate.
    pub async fn apply(
        &self,
        candidate: &CandidateAction,
        moderator: Moderator,
    ) -> Result<Applied, ExecutionError> {
        let key = lock_key(candidate)?;
        let lock = self.locks.entry(key).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(candidate, moderator).await
        };

        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn apply_locked(
        &self,
        candidate: &CandidateAction,
        moderator: Moderator,
    ) -> Result<Applied, ExecutionError> {
        if let Some(case) = self
            .ledger
            .find_by_source(
                candidate.guild_id,
                &candidate.source_event_id,
                candidate.action_type,
            )
            .await?
        {
            debug!(
                case_id = case.case_id,
                source_event_id = %candidate.source_event_id,
                "Action already applied"
            );
            return Ok(Applied::AlreadyApplied(case));
        }

        let action = candidate.action_type;
        self.with_retry(action, || self.dispatch(candidate)).await?;

        self.record_applied(candidate, moderator).await
    }

    /// Write the case for an action that already took effect. Storage errors
    /// are retried; the action itself is never sent again.
    async fn record_applied(
        &self,
        candidate: &CandidateAction,
        moderator: Moderator,
    ) -> Result<Applied, ExecutionError> {
        let action = candidate.action_type;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let new_case = NewCase::from_candidate(candidate, moderator, Utc::now());
            match self.ledger.record_case(new_case).await {
                Ok(case) => {
                    info!(
                        guild_id = case.guild_id,
                        case_id = case.case_id,
                        action = %action,
                        "Action applied"
                    );
                    return Ok(Applied::New(case));
                }
                Err(LedgerError::Duplicate { .. }) => {
                    // Another process recorded it between our check and insert.
                    let case = self
                        .ledger
                        .find_by_source(candidate.guild_id, &candidate.source_event_id, action)
                        .await?
                        .ok_or_else(|| LedgerError::Storage("duplicate case vanished".to_string()))?;
                    return Ok(Applied::AlreadyApplied(case));
                }
                Err(LedgerError::Storage(message)) if attempt < max_attempts => {
                    warn!(
                        guild_id = candidate.guild_id,
                        source_event_id = %candidate.source_event_id,
                        action = %action,
                        attempt,
                        error = %message,
                        "Case write failed, retrying"
                    );
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        guild_id = candidate.guild_id,
                        source_event_id = %candidate.source_event_id,
                        action = %action,
                        target = ?candidate.target,
                        error = %e,
                        "Action applied on the platform but no case was recorded"
                    );
                    return Err(ExecutionError::Unrecorded {
                        action,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Undo a case on the platform and mark it reverted.
    pub async fn revert(&self, case: &Case) -> Result<(), ExecutionError> {
        let key = (case.guild_id, case.target_user_id);
        let lock = self.locks.entry(key).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            match case.action_type {
                ActionType::Timeout | ActionType::Ban => {
                    self.with_retry(case.action_type, || {
                        self.platform.revoke_punishment(
                            case.guild_id,
                            case.target_user_id,
                            case.action_type,
                        )
                    })
                    .await
                }
                // A kicked member can simply rejoin.
                _ => Ok(()),
            }
        };

        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result?;

        self.ledger.mark_reverted(case.guild_id, case.case_id).await?;
        Ok(())
    }

    async fn dispatch(&self, candidate: &CandidateAction) -> Result<(), PlatformError> {
        match (&candidate.target, candidate.action_type) {
            (ActionTarget::User(user_id), action) if action.targets_member() => {
                self.platform
                    .send_punishment(
                        candidate.guild_id,
                        *user_id,
                        action,
                        candidate.duration_seconds,
                        &candidate.reason,
                    )
                    .await
            }
            (ActionTarget::Channel(channel_id), ActionType::SlowmodeAdjust) => {
                self.platform
                    .set_slowmode(*channel_id, candidate.duration_seconds.unwrap_or(0))
                    .await
            }
            (ActionTarget::Guild, ActionType::Lockdown) => {
                self.platform
                    .lockdown(candidate.guild_id, &candidate.reason)
                    .await
            }
            // Rejected up front by lock_key.
            _ => Err(PlatformError::Other("unsupported target".to_string())),
        }
    }

    async fn with_retry<F, Fut>(&self, action: ActionType, mut call: F) -> Result<(), ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PlatformError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(self.config.call_timeout, call()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => PlatformError::Timeout,
            };

            match error {
                PlatformError::Permission(message) => {
                    warn!(action = %action, error = %message, "Permission denied; not retrying");
                    return Err(ExecutionError::Permission { action, message });
                }
                e if e.is_transient() && attempt < max_attempts => {
                    let mut delay = self.config.backoff(attempt);
                    if let PlatformError::RateLimited {
                        retry_after: Some(after),
                    } = &e
                    {
                        delay = delay.max(*after);
                    }
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    delay += Duration::from_millis(jitter);

                    warn!(
                        action = %action,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient platform error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                e if e.is_transient() => {
                    return Err(ExecutionError::Exhausted {
                        action,
                        attempts: attempt,
                        last_error: e,
                    })
                }
                e => return Err(ExecutionError::Platform { action, error: e }),
            }
        }
    }
}

fn lock_key(candidate: &CandidateAction) -> Result<LockKey, ExecutionError> {
    let invalid = || ExecutionError::InvalidTarget {
        action: candidate.action_type,
        target: candidate.target.clone(),
    };
    match (&candidate.target, candidate.action_type) {
        (ActionTarget::User(user_id), action) if action.targets_member() => {
            Ok((candidate.guild_id, *user_id))
        }
        (ActionTarget::Channel(channel_id), ActionType::SlowmodeAdjust) => {
            Ok((candidate.guild_id, *channel_id))
        }
        (ActionTarget::Guild, ActionType::Lockdown) => Ok((candidate.guild_id, 0)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enforcement::mock_platform::{MockPlatform, PlatformCall};
    use crate::infra::cases::InMemoryCaseStore;

    type TestExecutor = ActionExecutor<MockPlatform, InMemoryCaseStore>;

    fn executor(platform: MockPlatform) -> (TestExecutor, Arc<MockPlatform>, Arc<CaseLedger<InMemoryCaseStore>>) {
        let platform = Arc::new(platform);
        let ledger = Arc::new(CaseLedger::new(InMemoryCaseStore::new()));
        let config = ExecutorConfig {
            max_attempts: 3,
            ..Default::default()
        };
        (
            ActionExecutor::new(platform.clone(), ledger.clone(), config),
            platform,
            ledger,
        )
    }

    fn ban(user_id: u64) -> CandidateAction {
        CandidateAction {
            source_event_id: "msg:1".to_string(),
            guild_id: 1,
            target: ActionTarget::User(user_id),
            action_type: ActionType::Ban,
            duration_seconds: None,
            reason: "spam".to_string(),
            rule_violated: Some("No spam".to_string()),
            channel_id: Some(10),
            message_id: Some(1),
        }
    }

    #[tokio::test]
    async fn applying_twice_records_one_case() {
        let (executor, platform, ledger) = executor(MockPlatform::new());

        let first = executor.apply(&ban(7), Moderator::System).await.unwrap();
        let second = executor.apply(&ban(7), Moderator::System).await.unwrap();

        assert!(matches!(first, Applied::New(_)));
        assert_eq!(second, Applied::AlreadyApplied(first.case().clone()));
        assert_eq!(platform.enforcement_calls().len(), 1);
        assert_eq!(ledger.list_recent_cases(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_applies_for_one_signal_run_once() {
        let (executor, platform, ledger) = executor(MockPlatform::new());
        let executor = Arc::new(executor);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.apply(&ban(7), Moderator::System).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(platform.enforcement_calls().len(), 1);
        assert_eq!(ledger.list_recent_cases(1, 10).await.unwrap().len(), 1);
        assert!(executor.locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (executor, platform, ledger) = executor(MockPlatform::failing_with(vec![
            PlatformError::RateLimited { retry_after: None },
            PlatformError::Transient("502".to_string()),
        ]));

        let applied = executor.apply(&ban(7), Moderator::System).await.unwrap();

        assert!(matches!(applied, Applied::New(_)));
        assert_eq!(platform.enforcement_calls().len(), 3);
        assert_eq!(ledger.list_recent_cases(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (executor, platform, ledger) =
            executor(MockPlatform::always_failing(PlatformError::Transient("503".to_string())));

        let result = executor.apply(&ban(7), Moderator::System).await;

        assert!(matches!(result, Err(ExecutionError::Exhausted { attempts: 3, .. })));
        assert_eq!(platform.enforcement_calls().len(), 3);
        assert!(ledger.list_recent_cases(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_calls_time_out_and_count_as_transient() {
        let (executor, platform, _ledger) = executor(MockPlatform::hanging(Duration::from_secs(600)));

        let result = executor.apply(&ban(7), Moderator::System).await;

        assert!(matches!(
            result,
            Err(ExecutionError::Exhausted {
                last_error: PlatformError::Timeout,
                ..
            })
        ));
        assert_eq!(platform.enforcement_calls().len(), 3);
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let (executor, platform, ledger) =
            executor(MockPlatform::always_failing(PlatformError::Permission("Ban Members".to_string())));

        let result = executor.apply(&ban(7), Moderator::System).await;

        assert!(result.unwrap_err().is_permission());
        assert_eq!(platform.enforcement_calls().len(), 1);
        assert!(ledger.list_recent_cases(1, 10).await.unwrap().is_empty());
    }

    fn executor_over(store: InMemoryCaseStore) -> (TestExecutor, Arc<MockPlatform>, Arc<CaseLedger<InMemoryCaseStore>>) {
        let platform = Arc::new(MockPlatform::new());
        let ledger = Arc::new(CaseLedger::new(store));
        let config = ExecutorConfig {
            max_attempts: 3,
            ..Default::default()
        };
        (
            ActionExecutor::new(platform.clone(), ledger.clone(), config),
            platform,
            ledger,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failed_case_write_is_retried_without_reapplying() {
        let store = InMemoryCaseStore::new();
        store.fail_next_inserts(2);
        let (executor, platform, ledger) = executor_over(store);

        let applied = executor.apply(&ban(7), Moderator::System).await.unwrap();

        assert!(matches!(applied, Applied::New(_)));
        assert_eq!(platform.enforcement_calls().len(), 1);
        assert_eq!(ledger.list_recent_cases(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_case_is_reported_as_unrecorded() {
        let store = InMemoryCaseStore::new();
        store.fail_next_inserts(10);
        let (executor, platform, ledger) = executor_over(store);

        let result = executor.apply(&ban(7), Moderator::System).await;

        assert!(matches!(
            result,
            Err(ExecutionError::Unrecorded {
                action: ActionType::Ban,
                ..
            })
        ));
        // The ban went out once and was not sent again.
        assert_eq!(platform.enforcement_calls().len(), 1);
        assert!(ledger.list_recent_cases(1, 10).await.unwrap().is_empty());
        assert!(matches!(
            ModerationError::from(result.unwrap_err()),
            ModerationError::Storage(_)
        ));
    }

    #[tokio::test]
    async fn multi_target_candidates_get_one_case_each() {
        let (executor, platform, ledger) = executor(MockPlatform::new());
        let mut candidate = ban(0);
        candidate.target = ActionTarget::Users(vec![3, 4]);

        let results = executor.apply_all(candidate, Moderator::System).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(Applied::New(_)))));
        assert_eq!(platform.enforcement_calls().len(), 2);
        let cases = ledger.list_recent_cases(1, 10).await.unwrap();
        assert_eq!(cases[0].source_event_id, "msg:1:4");
    }

    #[tokio::test]
    async fn slowmode_and_lockdown_dispatch_to_their_calls() {
        let (executor, platform, _ledger) = executor(MockPlatform::new());
        let slowmode = CandidateAction {
            source_event_id: "slowmode:10:0".to_string(),
            guild_id: 1,
            target: ActionTarget::Channel(10),
            action_type: ActionType::SlowmodeAdjust,
            duration_seconds: Some(5),
            reason: "busy".to_string(),
            rule_violated: None,
            channel_id: Some(10),
            message_id: None,
        };
        let lockdown = CandidateAction {
            source_event_id: "raid:1:0".to_string(),
            target: ActionTarget::Guild,
            action_type: ActionType::Lockdown,
            duration_seconds: None,
            ..slowmode.clone()
        };

        let case = executor.apply(&slowmode, Moderator::System).await.unwrap();
        assert_eq!(case.case().target_user_id, 0);
        executor.apply(&lockdown, Moderator::System).await.unwrap();

        assert_eq!(
            platform.enforcement_calls(),
            vec![
                PlatformCall::Slowmode {
                    channel_id: 10,
                    seconds: 5
                },
                PlatformCall::Lockdown { guild_id: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn mismatched_target_is_rejected() {
        let (executor, platform, _ledger) = executor(MockPlatform::new());
        let mut candidate = ban(7);
        candidate.target = ActionTarget::Channel(10);

        let result = executor.apply(&candidate, Moderator::System).await;
        assert!(matches!(result, Err(ExecutionError::InvalidTarget { .. })));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn revert_lifts_ban_and_marks_case() {
        let (executor, platform, ledger) = executor(MockPlatform::new());
        let applied = executor.apply(&ban(7), Moderator::System).await.unwrap();

        executor.revert(applied.case()).await.unwrap();

        assert_eq!(
            platform.enforcement_calls().last(),
            Some(&PlatformCall::Revoke {
                guild_id: 1,
                user_id: 7,
                action: ActionType::Ban
            })
        );
        let case = ledger.get_case(1, applied.case().case_id).await.unwrap();
        assert_eq!(case.status, crate::core::cases::CaseStatus::Reverted);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ExecutorConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(5), Duration::from_secs(8));
        assert_eq!(config.backoff(40), Duration::from_secs(8));
    }
}
