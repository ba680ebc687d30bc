// Platform capability on top of the Discord HTTP API.

use super::formatter::notice_message;
use crate::core::enforcement::{Notice, NotifyTarget, Platform, PlatformError};
use crate::core::moderation::ActionType;
use async_trait::async_trait;
use poise::serenity_prelude::{
    self as serenity, ChannelId, CreateMessage, EditChannel, EditMember, EditRole, GuildId, RoleId,
    UserId,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SerenityPlatform {
    http: Arc<serenity::Http>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }
}

/// Sort a serenity error into the pipeline's retry/permission buckets.
fn classify(e: serenity::Error) -> PlatformError {
    match e {
        serenity::Error::Http(http) => {
            let message = http.to_string();
            match http.status_code().map(|s| s.as_u16()) {
                Some(401) | Some(403) => PlatformError::Permission(message),
                Some(404) => PlatformError::NotFound(message),
                Some(429) => PlatformError::RateLimited { retry_after: None },
                Some(status) if status >= 500 => PlatformError::Transient(message),
                Some(_) => PlatformError::Other(message),
                // No response at all: connection problems.
                None => PlatformError::Transient(message),
            }
        }
        other => PlatformError::Other(other.to_string()),
    }
}

fn timeout_until(duration_seconds: u64) -> Result<serenity::Timestamp, PlatformError> {
    let until = chrono::Utc::now().timestamp() + duration_seconds as i64;
    serenity::Timestamp::from_unix_timestamp(until)
        .map_err(|e| PlatformError::Other(format!("invalid timeout timestamp: {}", e)))
}

/// A warning stands even when the member cannot be reached. Closed DMs and
/// departed users still count as delivered; only errors worth retrying are
/// returned.
fn settle_warning(user_id: u64, delivered: Result<(), PlatformError>) -> Result<(), PlatformError> {
    match delivered {
        Err(PlatformError::Permission(message)) | Err(PlatformError::NotFound(message)) => {
            debug!(user_id, error = %message, "Warning recorded without a DM");
            Ok(())
        }
        other => other,
    }
}

impl SerenityPlatform {
    async fn direct_message(&self, user_id: u64, message: CreateMessage) -> Result<(), PlatformError> {
        UserId::new(user_id)
            .direct_message(&*self.http, message)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Tell the member why before they lose access. Failures are expected
    /// (closed DMs) and ignored.
    async fn dm_punishment_notice(&self, guild_id: u64, user_id: u64, action: ActionType, reason: &str) {
        let notice = Notice::new(
            format!("Moderation action: {}", action),
            format!("You received a {} in server {}.", action, guild_id),
        )
        .field("Reason", reason);
        if let Err(e) = self.direct_message(user_id, notice_message(&notice)).await {
            debug!(user_id, error = %e, "Could not DM member");
        }
    }
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn send_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
        duration_seconds: Option<u64>,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let guild = GuildId::new(guild_id);
        let user = UserId::new(user_id);

        match action {
            ActionType::Warn => {
                let notice = Notice::new("You have been warned", format!("Server {}", guild_id))
                    .field("Reason", reason);
                let delivered = self.direct_message(user_id, notice_message(&notice)).await;
                settle_warning(user_id, delivered)
            }
            ActionType::Timeout => {
                let seconds = duration_seconds.ok_or_else(|| {
                    PlatformError::Other("timeout without a duration".to_string())
                })?;
                guild
                    .edit_member(
                        &*self.http,
                        user,
                        EditMember::new()
                            .disable_communication_until_datetime(timeout_until(seconds)?)
                            .audit_log_reason(reason),
                    )
                    .await
                    .map_err(classify)?;
                self.dm_punishment_notice(guild_id, user_id, action, reason).await;
                Ok(())
            }
            ActionType::Kick => {
                self.dm_punishment_notice(guild_id, user_id, action, reason).await;
                guild
                    .kick_with_reason(&*self.http, user, reason)
                    .await
                    .map_err(classify)
            }
            ActionType::Ban => {
                self.dm_punishment_notice(guild_id, user_id, action, reason).await;
                guild
                    .ban_with_reason(&*self.http, user, 0, reason)
                    .await
                    .map_err(classify)
            }
            ActionType::Lockdown | ActionType::SlowmodeAdjust => Err(PlatformError::Other(format!(
                "{} is not a member punishment",
                action
            ))),
        }
    }

    async fn revoke_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
    ) -> Result<(), PlatformError> {
        let guild = GuildId::new(guild_id);
        let user = UserId::new(user_id);
        match action {
            ActionType::Timeout => guild
                .edit_member(&*self.http, user, EditMember::new().enable_communication())
                .await
                .map(|_| ())
                .map_err(classify),
            ActionType::Ban => guild.unban(&*self.http, user).await.map_err(classify),
            other => {
                warn!(guild_id, user_id, action = %other, "Nothing to revoke on the platform");
                Ok(())
            }
        }
    }

    async fn set_slowmode(&self, channel_id: u64, seconds: u64) -> Result<(), PlatformError> {
        // Discord caps slowmode at 6 hours.
        let seconds = seconds.min(21_600) as u16;
        ChannelId::new(channel_id)
            .edit(&*self.http, EditChannel::new().rate_limit_per_user(seconds))
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn current_slowmode(&self, channel_id: u64) -> Result<Option<u64>, PlatformError> {
        let channel = ChannelId::new(channel_id)
            .to_channel(&*self.http)
            .await
            .map_err(classify)?;
        Ok(channel
            .guild()
            .map(|c| u64::from(c.rate_limit_per_user.unwrap_or(0))))
    }

    async fn lockdown(&self, guild_id: u64, reason: &str) -> Result<(), PlatformError> {
        let guild = GuildId::new(guild_id);
        // @everyone role ID is same as guild ID
        let everyone = RoleId::new(guild_id);

        let roles = guild.roles(&*self.http).await.map_err(classify)?;
        let role = roles
            .get(&everyone)
            .ok_or_else(|| PlatformError::NotFound("@everyone role".to_string()))?;
        let permissions = role.permissions.difference(
            serenity::Permissions::SEND_MESSAGES | serenity::Permissions::SEND_MESSAGES_IN_THREADS,
        );

        guild
            .edit_role(
                &*self.http,
                everyone,
                EditRole::new().permissions(permissions).audit_log_reason(reason),
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn notify(&self, target: NotifyTarget, notice: &Notice) -> Result<(), PlatformError> {
        let message = notice_message(notice);
        match target {
            NotifyTarget::Channel(channel_id) => ChannelId::new(channel_id)
                .send_message(&*self.http, message)
                .await
                .map(|_| ())
                .map_err(classify),
            NotifyTarget::User(user_id) => self.direct_message(user_id, message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_member_still_counts_as_warned() {
        let closed = Err(PlatformError::Permission("Cannot send messages to this user".to_string()));
        assert_eq!(settle_warning(7, closed), Ok(()));

        let gone = Err(PlatformError::NotFound("Unknown User".to_string()));
        assert_eq!(settle_warning(7, gone), Ok(()));
    }

    #[test]
    fn retryable_dm_failures_are_passed_on() {
        let flaky = Err(PlatformError::Transient("502 Bad Gateway".to_string()));
        assert!(matches!(settle_warning(7, flaky), Err(PlatformError::Transient(_))));
        assert_eq!(
            settle_warning(7, Err(PlatformError::Timeout)),
            Err(PlatformError::Timeout)
        );
    }
}
