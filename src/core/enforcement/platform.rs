// Platform capability - the only way the pipeline touches the chat platform.

use crate::core::moderation::{ActionType, ModerationError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Rate limited by the platform")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Platform call timed out")]
    Timeout,

    #[error("Transient platform failure: {0}")]
    Transient(String),

    #[error("Missing permission: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Platform error: {0}")]
    Other(String),
}

impl PlatformError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. } | PlatformError::Timeout | PlatformError::Transient(_)
        )
    }
}

impl From<PlatformError> for ModerationError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Permission(msg) => ModerationError::Permission(msg),
            PlatformError::NotFound(msg) => ModerationError::NotFound(msg),
            other if other.is_transient() => ModerationError::TransientPlatform(other.to_string()),
            other => ModerationError::InvalidRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyTarget {
    Channel(u64),
    User(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoticeLevel {
    #[default]
    Info,
    Warning,
    Alert,
}

/// A message for moderators or members. Rendering is up to the platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub fields: Vec<(String, String)>,
    pub level: NoticeLevel,
    /// Role to ping alongside the notice.
    pub mention_role: Option<u64>,
    /// Attach approve/reject controls for this confirmation request.
    pub confirmation_request: Option<Uuid>,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    pub fn level(mut self, level: NoticeLevel) -> Self {
        self.level = level;
        self
    }

    pub fn mention(mut self, role: Option<u64>) -> Self {
        self.mention_role = role;
        self
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Warn (DM), time out, kick or ban a member.
    async fn send_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
        duration_seconds: Option<u64>,
        reason: &str,
    ) -> Result<(), PlatformError>;

    /// Undo a timeout or ban.
    async fn revoke_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
    ) -> Result<(), PlatformError>;

    async fn set_slowmode(&self, channel_id: u64, seconds: u64) -> Result<(), PlatformError>;

    /// Slowmode the channel has right now. `None` when it is not a text
    /// channel the platform reports one for.
    async fn current_slowmode(&self, channel_id: u64) -> Result<Option<u64>, PlatformError>;

    /// Stop everyone from sending messages in the guild.
    async fn lockdown(&self, guild_id: u64, reason: &str) -> Result<(), PlatformError>;

    async fn notify(&self, target: NotifyTarget, notice: &Notice) -> Result<(), PlatformError>;
}
