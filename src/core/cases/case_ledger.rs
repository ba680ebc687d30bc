use super::case_models::{Appeal, AppealStatus, Case, CaseStatus, LedgerError, NewCase};
use crate::core::moderation::ActionType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// Narrow repository port for cases and appeals.
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert a case, allocating the next per-guild case id.
    ///
    /// Must fail with `LedgerError::Duplicate` if a case with the same
    /// guild, source event and action type exists.
    async fn insert_case(&self, case: NewCase) -> Result<Case, LedgerError>;
    async fn find_by_source(
        &self,
        guild_id: u64,
        source_event_id: &str,
        action_type: ActionType,
    ) -> Result<Option<Case>, LedgerError>;
    async fn get_case(&self, guild_id: u64, case_id: u64) -> Result<Option<Case>, LedgerError>;
    /// Newest first.
    async fn list_user_cases(
        &self,
        guild_id: u64,
        user_id: u64,
        limit: u32,
    ) -> Result<Vec<Case>, LedgerError>;
    /// Newest first.
    async fn list_recent_cases(&self, guild_id: u64, limit: u32) -> Result<Vec<Case>, LedgerError>;
    async fn set_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        status: CaseStatus,
    ) -> Result<bool, LedgerError>;

    async fn insert_appeal(&self, appeal: &Appeal) -> Result<(), LedgerError>;
    async fn get_appeal(&self, appeal_id: Uuid) -> Result<Option<Appeal>, LedgerError>;
    async fn pending_appeal_for_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<Appeal>, LedgerError>;
    /// Move a pending appeal to `status`. Returns false if it was not pending.
    async fn resolve_pending_appeal(
        &self,
        appeal_id: Uuid,
        status: AppealStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;
    async fn list_appeals(
        &self,
        guild_id: u64,
        status: Option<AppealStatus>,
    ) -> Result<Vec<Appeal>, LedgerError>;
}

/// How far back to look for a member's latest appealable case.
const APPEAL_LOOKBACK: u32 = 50;

/// Single entry point every decision producer records through.
pub struct CaseLedger<S: CaseStore> {
    store: S,
}

impl<S: CaseStore> CaseLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn record_case(&self, case: NewCase) -> Result<Case, LedgerError> {
        let case = self.store.insert_case(case).await?;
        info!(
            guild_id = case.guild_id,
            case_id = case.case_id,
            target_user_id = case.target_user_id,
            action = %case.action_type,
            source_event_id = %case.source_event_id,
            "Case recorded"
        );
        Ok(case)
    }

    pub async fn find_by_source(
        &self,
        guild_id: u64,
        source_event_id: &str,
        action_type: ActionType,
    ) -> Result<Option<Case>, LedgerError> {
        self.store
            .find_by_source(guild_id, source_event_id, action_type)
            .await
    }

    pub async fn get_case(&self, guild_id: u64, case_id: u64) -> Result<Case, LedgerError> {
        self.store
            .get_case(guild_id, case_id)
            .await?
            .ok_or(LedgerError::CaseNotFound(case_id))
    }

    pub async fn list_user_cases(
        &self,
        guild_id: u64,
        user_id: u64,
        limit: u32,
    ) -> Result<Vec<Case>, LedgerError> {
        self.store.list_user_cases(guild_id, user_id, limit).await
    }

    pub async fn list_recent_cases(&self, guild_id: u64, limit: u32) -> Result<Vec<Case>, LedgerError> {
        self.store.list_recent_cases(guild_id, limit).await
    }

    pub async fn mark_reverted(&self, guild_id: u64, case_id: u64) -> Result<(), LedgerError> {
        if !self
            .store
            .set_case_status(guild_id, case_id, CaseStatus::Reverted)
            .await?
        {
            return Err(LedgerError::CaseNotFound(case_id));
        }
        info!(guild_id, case_id, "Case reverted");
        Ok(())
    }

    /// Latest timeout, kick or ban still in effect for the member.
    pub async fn latest_appealable_case(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<Case>, LedgerError> {
        let cases = self
            .store
            .list_user_cases(guild_id, user_id, APPEAL_LOOKBACK)
            .await?;
        Ok(cases
            .into_iter()
            .find(|c| c.action_type.is_appealable() && c.status == CaseStatus::Applied))
    }

    pub async fn record_appeal(&self, appeal: Appeal) -> Result<Uuid, LedgerError> {
        if let Some(existing) = self
            .store
            .pending_appeal_for_case(appeal.guild_id, appeal.original_case.case_id)
            .await?
        {
            return Err(LedgerError::AppealAlreadyPending(existing.original_case.case_id));
        }
        self.store.insert_appeal(&appeal).await?;
        info!(
            guild_id = appeal.guild_id,
            appeal_id = %appeal.appeal_id,
            case_id = appeal.original_case.case_id,
            "Appeal recorded"
        );
        Ok(appeal.appeal_id)
    }

    /// File an appeal against the member's latest appealable case.
    pub async fn submit_appeal(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Appeal, LedgerError> {
        let case = self
            .latest_appealable_case(guild_id, user_id)
            .await?
            .ok_or(LedgerError::NoAppealableCase)?;
        let appeal = Appeal::new(case, reason, now);
        self.record_appeal(appeal.clone()).await?;
        Ok(appeal)
    }

    pub async fn get_appeal(&self, appeal_id: Uuid) -> Result<Appeal, LedgerError> {
        self.store
            .get_appeal(appeal_id)
            .await?
            .ok_or(LedgerError::AppealNotFound(appeal_id))
    }

    /// Approve or deny a pending appeal. The stored case snapshot is untouched.
    pub async fn resolve_appeal(
        &self,
        appeal_id: Uuid,
        status: AppealStatus,
        now: DateTime<Utc>,
    ) -> Result<Appeal, LedgerError> {
        if status == AppealStatus::Pending {
            return Err(LedgerError::InvalidResolution);
        }

        let appeal = self.get_appeal(appeal_id).await?;
        if !self
            .store
            .resolve_pending_appeal(appeal_id, status, now)
            .await?
        {
            return Err(LedgerError::AppealAlreadyResolved(appeal_id));
        }

        info!(
            guild_id = appeal.guild_id,
            appeal_id = %appeal_id,
            status = %status,
            "Appeal resolved"
        );
        Ok(Appeal {
            status,
            updated_at: now,
            ..appeal
        })
    }

    pub async fn list_appeals(
        &self,
        guild_id: u64,
        status: Option<AppealStatus>,
    ) -> Result<Vec<Appeal>, LedgerError> {
        self.store.list_appeals(guild_id, status).await
    }
}
