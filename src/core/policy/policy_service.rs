use super::compiled_policy::{validate, CompiledPolicy, ConfigError, PolicySnapshot};
use super::policy_models::{GuildPolicy, PolicySection};
use crate::core::moderation::ModerationError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("Malformed section '{section}': {message}")]
    Malformed {
        section: PolicySection,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<PolicyError> for ModerationError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Storage(msg) => ModerationError::Storage(msg),
            other => ModerationError::Config(other.to_string()),
        }
    }
}

/// Section documents as stored for one guild.
#[derive(Debug, Clone, Default)]
pub struct StoredPolicy {
    pub sections: Vec<(PolicySection, serde_json::Value)>,
    /// Highest revision across the guild's sections; 0 when nothing is stored.
    pub revision: i64,
}

/// Port for the external configuration store.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn revision(&self, guild_id: u64) -> Result<i64, PolicyError>;
    async fn load_sections(&self, guild_id: u64) -> Result<StoredPolicy, PolicyError>;
    /// Store one section document; returns the new revision.
    async fn save_section(
        &self,
        guild_id: u64,
        section: PolicySection,
        value: serde_json::Value,
    ) -> Result<i64, PolicyError>;
}

/// Hands out immutable per-guild policy snapshots.
///
/// Snapshots are re-fetched on every call; compilation is only redone when the
/// stored revision moved.
pub struct PolicyService<S: PolicyStore> {
    store: S,
    cache: DashMap<u64, PolicySnapshot>,
}

impl<S: PolicyStore> PolicyService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    pub async fn snapshot(&self, guild_id: u64) -> Result<PolicySnapshot, PolicyError> {
        let revision = self.store.revision(guild_id).await?;
        if let Some(cached) = self.cache.get(&guild_id) {
            if cached.revision == revision {
                return Ok(cached.clone());
            }
        }

        let stored = self.store.load_sections(guild_id).await?;
        let mut policy = GuildPolicy::default_for(guild_id);
        // A section that cannot be read, or that breaks validation, keeps its
        // defaults. Defaults always validate, so the result does too.
        for (section, value) in stored.sections {
            let mut candidate = policy.clone();
            if let Err(e) = candidate.apply_section(section, value) {
                warn!(guild_id, %section, error = %e, "Ignoring unreadable policy section");
                continue;
            }
            if let Err(e) = validate(&candidate) {
                warn!(guild_id, %section, error = %e, "Ignoring invalid policy section");
                continue;
            }
            policy = candidate;
        }

        let snapshot = Arc::new(CompiledPolicy::compile(policy, stored.revision));
        self.cache.insert(guild_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Validate and store every section of a policy.
    pub async fn save(&self, policy: &GuildPolicy) -> Result<(), PolicyError> {
        validate(policy)?;
        for section in PolicySection::ALL {
            let value = policy
                .section_value(section)
                .map_err(|e| PolicyError::Malformed {
                    section,
                    message: e.to_string(),
                })?;
            self.store
                .save_section(policy.guild_id, section, value)
                .await?;
        }
        self.cache.remove(&policy.guild_id);
        info!(guild_id = policy.guild_id, "Policy saved");
        Ok(())
    }

    /// Replace one section, validating the resulting policy as a whole.
    pub async fn save_section(
        &self,
        guild_id: u64,
        section: PolicySection,
        value: serde_json::Value,
    ) -> Result<(), PolicyError> {
        let current = self.snapshot(guild_id).await?;
        let mut policy = current.policy.clone();
        policy
            .apply_section(section, value.clone())
            .map_err(|e| PolicyError::Malformed {
                section,
                message: e.to_string(),
            })?;
        validate(&policy)?;

        self.store.save_section(guild_id, section, value).await?;
        self.cache.remove(&guild_id);
        info!(guild_id, %section, "Policy section saved");
        Ok(())
    }
}
