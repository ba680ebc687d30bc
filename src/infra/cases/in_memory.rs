// In-memory CaseStore. Used by tests and when running without a database.

use crate::core::cases::{Appeal, AppealStatus, Case, CaseStatus, CaseStore, LedgerError, NewCase};
use crate::core::moderation::ActionType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
struct GuildCases {
    last_case_id: u64,
    cases: Vec<Case>,
}

/// Cases are grouped per guild; the guild's map entry is the lock that keeps
/// id allocation and the duplicate check atomic.
#[derive(Default)]
pub struct InMemoryCaseStore {
    guilds: DashMap<u64, GuildCases>,
    appeals: DashMap<Uuid, Appeal>,
    #[cfg(test)]
    failing_inserts: std::sync::atomic::AtomicU32,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` case inserts fail with a storage error.
    #[cfg(test)]
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

fn newest_first(mut cases: Vec<Case>, limit: u32) -> Vec<Case> {
    cases.sort_by(|a, b| b.case_id.cmp(&a.case_id));
    cases.truncate(limit as usize);
    cases
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn insert_case(&self, case: NewCase) -> Result<Case, LedgerError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let failing = self
                .failing_inserts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(LedgerError::Storage("database is locked".to_string()));
            }
        }

        let mut guild = self.guilds.entry(case.guild_id).or_default();
        if guild.cases.iter().any(|c| {
            c.source_event_id == case.source_event_id && c.action_type == case.action_type
        }) {
            return Err(LedgerError::Duplicate {
                source_event_id: case.source_event_id,
                action_type: case.action_type,
            });
        }

        guild.last_case_id += 1;
        let case = case.into_case(guild.last_case_id);
        guild.cases.push(case.clone());
        Ok(case)
    }

    async fn find_by_source(
        &self,
        guild_id: u64,
        source_event_id: &str,
        action_type: ActionType,
    ) -> Result<Option<Case>, LedgerError> {
        Ok(self.guilds.get(&guild_id).and_then(|g| {
            g.cases
                .iter()
                .find(|c| c.source_event_id == source_event_id && c.action_type == action_type)
                .cloned()
        }))
    }

    async fn get_case(&self, guild_id: u64, case_id: u64) -> Result<Option<Case>, LedgerError> {
        Ok(self
            .guilds
            .get(&guild_id)
            .and_then(|g| g.cases.iter().find(|c| c.case_id == case_id).cloned()))
    }

    async fn list_user_cases(
        &self,
        guild_id: u64,
        user_id: u64,
        limit: u32,
    ) -> Result<Vec<Case>, LedgerError> {
        let cases = self
            .guilds
            .get(&guild_id)
            .map(|g| {
                g.cases
                    .iter()
                    .filter(|c| c.target_user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(newest_first(cases, limit))
    }

    async fn list_recent_cases(&self, guild_id: u64, limit: u32) -> Result<Vec<Case>, LedgerError> {
        let cases = self
            .guilds
            .get(&guild_id)
            .map(|g| g.cases.clone())
            .unwrap_or_default();
        Ok(newest_first(cases, limit))
    }

    async fn set_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        status: CaseStatus,
    ) -> Result<bool, LedgerError> {
        let Some(mut guild) = self.guilds.get_mut(&guild_id) else {
            return Ok(false);
        };
        match guild.cases.iter_mut().find(|c| c.case_id == case_id) {
            Some(case) => {
                case.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_appeal(&self, appeal: &Appeal) -> Result<(), LedgerError> {
        self.appeals.insert(appeal.appeal_id, appeal.clone());
        Ok(())
    }

    async fn get_appeal(&self, appeal_id: Uuid) -> Result<Option<Appeal>, LedgerError> {
        Ok(self.appeals.get(&appeal_id).map(|a| a.clone()))
    }

    async fn pending_appeal_for_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<Appeal>, LedgerError> {
        Ok(self
            .appeals
            .iter()
            .find(|a| {
                a.guild_id == guild_id
                    && a.original_case.case_id == case_id
                    && a.status == AppealStatus::Pending
            })
            .map(|a| a.clone()))
    }

    async fn resolve_pending_appeal(
        &self,
        appeal_id: Uuid,
        status: AppealStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let Some(mut appeal) = self.appeals.get_mut(&appeal_id) else {
            return Ok(false);
        };
        if appeal.status != AppealStatus::Pending {
            return Ok(false);
        }
        appeal.status = status;
        appeal.updated_at = updated_at;
        Ok(true)
    }

    async fn list_appeals(
        &self,
        guild_id: u64,
        status: Option<AppealStatus>,
    ) -> Result<Vec<Appeal>, LedgerError> {
        let mut appeals: Vec<Appeal> = self
            .appeals
            .iter()
            .filter(|a| a.guild_id == guild_id && status.map_or(true, |s| a.status == s))
            .map(|a| a.clone())
            .collect();
        appeals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(appeals)
    }
}
