// Human-in-the-loop gate for actions configured as manual.
//
// Each request is a small state machine:
//   awaiting -> approved | rejected | expired
// Every transition out of `awaiting` is a single compare-and-swap, so a
// moderator's click and the expiry timer can race and exactly one wins.

use crate::core::enforcement::{Notice, NoticeLevel, NotifyTarget, Platform};
use crate::core::moderation::{ActionTarget, CandidateAction, ModerationError};
use crate::core::policy::GuildPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmationState {
    Awaiting = 0,
    Approved = 1,
    Rejected = 2,
    Expired = 3,
}

impl ConfirmationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConfirmationState::Approved,
            2 => ConfirmationState::Rejected,
            3 => ConfirmationState::Expired,
            _ => ConfirmationState::Awaiting,
        }
    }
}

impl fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmationState::Awaiting => "awaiting",
            ConfirmationState::Approved => "approved",
            ConfirmationState::Rejected => "rejected",
            ConfirmationState::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("Confirmation request {0} not found")]
    NotFound(Uuid),

    #[error("Confirmation request {request_id} is already {state}")]
    AlreadyResolved {
        request_id: Uuid,
        state: ConfirmationState,
    },
}

impl From<ConfirmationError> for ModerationError {
    fn from(e: ConfirmationError) -> Self {
        match e {
            ConfirmationError::NotFound(_) => ModerationError::NotFound(e.to_string()),
            other => ModerationError::InvalidRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub request_id: Uuid,
    pub candidate: CandidateAction,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct Slot {
    request: ConfirmationRequest,
    state: AtomicU8,
    timer: Mutex<Option<JoinHandle<()>>>,
    notice_channel: Option<u64>,
    ping_target: Option<u64>,
}

impl Slot {
    fn transition(&self, to: ConfirmationState) -> Result<(), ConfirmationState> {
        self.state
            .compare_exchange(
                ConfirmationState::Awaiting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ConfirmationState::from_u8)
    }

    fn state(&self) -> ConfirmationState {
        ConfirmationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

pub struct ConfirmationCoordinator<P: Platform + 'static> {
    platform: Arc<P>,
    slots: Arc<DashMap<Uuid, Arc<Slot>>>,
}

impl<P: Platform + 'static> ConfirmationCoordinator<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self {
            platform,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Park a candidate until a moderator approves or rejects it, or it expires.
    pub async fn submit(&self, candidate: CandidateAction, policy: &GuildPolicy) -> ConfirmationRequest {
        let timeout = Duration::from_secs(policy.moderation.confirmation_timeout_seconds.max(1));
        let created_at = Utc::now();
        let request = ConfirmationRequest {
            request_id: Uuid::new_v4(),
            expires_at: created_at
                + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::minutes(5)),
            created_at,
            candidate,
        };

        let slot = Arc::new(Slot {
            request: request.clone(),
            state: AtomicU8::new(ConfirmationState::Awaiting as u8),
            timer: Mutex::new(None),
            notice_channel: policy.notice_channel(),
            ping_target: policy.moderation.confirmation_ping_target,
        });
        self.slots.insert(request.request_id, slot.clone());

        // The timer owns the expiry; nothing else can leave a request awaiting.
        let timer = {
            let slot = slot.clone();
            let platform = self.platform.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire_slot(&slot, platform.as_ref()).await;
            })
        };
        if let Ok(mut guard) = slot.timer.lock() {
            *guard = Some(timer);
        }

        info!(
            guild_id = request.candidate.guild_id,
            request_id = %request.request_id,
            action = %request.candidate.action_type,
            "Awaiting moderator confirmation"
        );

        match slot.notice_channel {
            Some(channel_id) => {
                let notice = request_notice(&request, slot.ping_target);
                if let Err(e) = self
                    .platform
                    .notify(NotifyTarget::Channel(channel_id), &notice)
                    .await
                {
                    warn!(request_id = %request.request_id, error = %e, "Failed to post confirmation request");
                }
            }
            None => warn!(
                guild_id = request.candidate.guild_id,
                request_id = %request.request_id,
                "No channel configured for confirmation requests; it will expire"
            ),
        }

        request
    }

    /// Approve a request. Returns the candidate to execute, exactly once.
    pub fn approve(&self, request_id: Uuid, moderator_id: u64) -> Result<CandidateAction, ConfirmationError> {
        let slot = self.slot(request_id)?;
        if let Err(state) = slot.transition(ConfirmationState::Approved) {
            if state == ConfirmationState::Expired {
                warn!(%request_id, moderator_id, "Approval arrived after expiry; discarded");
            } else {
                debug!(%request_id, moderator_id, %state, "Approval for resolved request ignored");
            }
            return Err(ConfirmationError::AlreadyResolved { request_id, state });
        }
        slot.cancel_timer();
        info!(%request_id, moderator_id, "Confirmation approved");
        Ok(slot.request.candidate.clone())
    }

    pub fn reject(&self, request_id: Uuid, moderator_id: u64) -> Result<ConfirmationRequest, ConfirmationError> {
        let slot = self.slot(request_id)?;
        if let Err(state) = slot.transition(ConfirmationState::Rejected) {
            debug!(%request_id, moderator_id, %state, "Rejection for resolved request ignored");
            return Err(ConfirmationError::AlreadyResolved { request_id, state });
        }
        slot.cancel_timer();
        info!(%request_id, moderator_id, "Confirmation rejected");
        Ok(slot.request.clone())
    }

    /// Expire a request now. Returns true if this call did the transition.
    pub async fn expire(&self, request_id: Uuid) -> bool {
        match self.slot(request_id) {
            Ok(slot) => expire_slot(&slot, self.platform.as_ref()).await,
            Err(_) => false,
        }
    }

    pub fn state(&self, request_id: Uuid) -> Option<ConfirmationState> {
        self.slots.get(&request_id).map(|slot| slot.state())
    }

    pub fn request(&self, request_id: Uuid) -> Option<ConfirmationRequest> {
        self.slots.get(&request_id).map(|slot| slot.request.clone())
    }

    pub fn awaiting_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() == ConfirmationState::Awaiting)
            .count()
    }

    /// Forget resolved requests whose deadline has passed.
    pub fn prune_resolved(&self, now: DateTime<Utc>) {
        self.slots.retain(|_, slot| {
            slot.state() == ConfirmationState::Awaiting || slot.request.expires_at > now
        });
    }

    fn slot(&self, request_id: Uuid) -> Result<Arc<Slot>, ConfirmationError> {
        self.slots
            .get(&request_id)
            .map(|slot| slot.clone())
            .ok_or(ConfirmationError::NotFound(request_id))
    }
}

async fn expire_slot<P: Platform + ?Sized>(slot: &Slot, platform: &P) -> bool {
    let request = &slot.request;
    if slot.transition(ConfirmationState::Expired).is_err() {
        return false;
    }
    info!(
        guild_id = request.candidate.guild_id,
        request_id = %request.request_id,
        "Confirmation request expired"
    );

    let Some(channel_id) = slot.notice_channel else {
        return true;
    };
    let notice = Notice::new(
        "Confirmation expired",
        format!(
            "No moderator responded. The {} was not applied.",
            request.candidate.action_type
        ),
    )
    .field("Request", request.request_id)
    .field("Reason", &request.candidate.reason)
    .level(NoticeLevel::Warning)
    .mention(slot.ping_target);

    if let Err(e) = platform.notify(NotifyTarget::Channel(channel_id), &notice).await {
        warn!(request_id = %request.request_id, error = %e, "Failed to send expiry notice");
    }
    true
}

fn describe_target(target: &ActionTarget) -> String {
    match target {
        ActionTarget::User(id) => format!("<@{}>", id),
        ActionTarget::Users(ids) => format!("{} members", ids.len()),
        ActionTarget::Channel(id) => format!("<#{}>", id),
        ActionTarget::Guild => "whole server".to_string(),
    }
}

fn request_notice(request: &ConfirmationRequest, ping_target: Option<u64>) -> Notice {
    let candidate = &request.candidate;
    let mut notice = Notice::new(
        "Moderator confirmation required",
        format!(
            "Proposed **{}** against {}",
            candidate.action_type,
            describe_target(&candidate.target)
        ),
    )
    .field("Reason", &candidate.reason)
    .field("Expires", format!("<t:{}:R>", request.expires_at.timestamp()))
    .level(NoticeLevel::Warning)
    .mention(ping_target);

    if let Some(rule) = &candidate.rule_violated {
        notice = notice.field("Rule", rule);
    }
    if let Some(duration) = candidate.duration_seconds {
        notice = notice.field("Duration", format!("{}s", duration));
    }
    notice.confirmation_request = Some(request.request_id);
    notice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enforcement::mock_platform::MockPlatform;
    use crate::core::moderation::ActionType;

    fn candidate() -> CandidateAction {
        CandidateAction {
            source_event_id: "msg:1".to_string(),
            guild_id: 1,
            target: ActionTarget::User(7),
            action_type: ActionType::Ban,
            duration_seconds: None,
            reason: "spam".to_string(),
            rule_violated: None,
            channel_id: Some(10),
            message_id: Some(1),
        }
    }

    fn policy() -> GuildPolicy {
        let mut policy = GuildPolicy::default_for(1);
        policy.moderation.mod_log_channel = Some(99);
        policy.moderation.confirmation_ping_target = Some(5);
        policy.moderation.confirmation_timeout_seconds = 300;
        policy
    }

    fn expiry_notices(platform: &MockPlatform) -> usize {
        platform
            .notices()
            .iter()
            .filter(|(_, n)| n.title == "Confirmation expired")
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn request_is_posted_with_controls() {
        let platform = Arc::new(MockPlatform::new());
        let coordinator = ConfirmationCoordinator::new(platform.clone());

        let request = coordinator.submit(candidate(), &policy()).await;

        let notices = platform.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NotifyTarget::Channel(99));
        assert_eq!(notices[0].1.confirmation_request, Some(request.request_id));
        assert_eq!(notices[0].1.mention_role, Some(5));
        assert_eq!(coordinator.state(request.request_id), Some(ConfirmationState::Awaiting));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_yields_candidate_once() {
        let platform = Arc::new(MockPlatform::new());
        let coordinator = ConfirmationCoordinator::new(platform.clone());
        let request = coordinator.submit(candidate(), &policy()).await;

        assert_eq!(coordinator.approve(request.request_id, 42), Ok(candidate()));
        assert!(matches!(
            coordinator.approve(request.request_id, 43),
            Err(ConfirmationError::AlreadyResolved {
                state: ConfirmationState::Approved,
                ..
            })
        ));

        // The timer was cancelled: no expiry later.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(coordinator.state(request.request_id), Some(ConfirmationState::Approved));
        assert_eq!(expiry_notices(&platform), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_expires_and_notifies_once() {
        let platform = Arc::new(MockPlatform::new());
        let coordinator = ConfirmationCoordinator::new(platform.clone());
        let request = coordinator.submit(candidate(), &policy()).await;

        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(coordinator.state(request.request_id), Some(ConfirmationState::Expired));
        assert_eq!(expiry_notices(&platform), 1);
        assert!(!coordinator.expire(request.request_id).await);
        assert_eq!(expiry_notices(&platform), 1);

        let late = coordinator.approve(request.request_id, 42);
        assert_eq!(
            late,
            Err(ConfirmationError::AlreadyResolved {
                request_id: request.request_id,
                state: ConfirmationState::Expired
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn approve_and_expire_race_has_one_winner() {
        let platform = Arc::new(MockPlatform::new());
        let coordinator = Arc::new(ConfirmationCoordinator::new(platform.clone()));

        for _ in 0..50 {
            let request = coordinator.submit(candidate(), &policy()).await;
            let id = request.request_id;

            let approver = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.approve(id, 42).is_ok() })
            };
            let expirer = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.expire(id).await })
            };
            let approved = approver.await.unwrap();
            let expired = expirer.await.unwrap();

            assert!(approved ^ expired, "exactly one writer must win");
            let state = coordinator.state(id).unwrap();
            assert_eq!(
                state,
                if approved {
                    ConfirmationState::Approved
                } else {
                    ConfirmationState::Expired
                }
            );
        }

        assert!(expiry_notices(&platform) <= 50);
        assert_eq!(coordinator.awaiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_pruned_after_deadline() {
        let platform = Arc::new(MockPlatform::new());
        let coordinator = ConfirmationCoordinator::new(platform);
        let request = coordinator.submit(candidate(), &policy()).await;

        coordinator.reject(request.request_id, 42).unwrap();
        coordinator.prune_resolved(Utc::now());
        assert!(coordinator.state(request.request_id).is_some());

        coordinator.prune_resolved(request.expires_at + ChronoDuration::seconds(1));
        assert_eq!(coordinator.state(request.request_id), None);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let coordinator = ConfirmationCoordinator::new(Arc::new(MockPlatform::new()));
        let id = Uuid::new_v4();
        assert_eq!(coordinator.approve(id, 1), Err(ConfirmationError::NotFound(id)));
    }
}
