// Recording Platform used by the pipeline tests.

use super::platform::{Notice, NotifyTarget, Platform, PlatformError};
use crate::core::moderation::ActionType;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    Punish {
        guild_id: u64,
        user_id: u64,
        action: ActionType,
        duration_seconds: Option<u64>,
    },
    Revoke {
        guild_id: u64,
        user_id: u64,
        action: ActionType,
    },
    Slowmode {
        channel_id: u64,
        seconds: u64,
    },
    Lockdown {
        guild_id: u64,
    },
    Notify {
        target: NotifyTarget,
        notice: Notice,
    },
}

#[derive(Default)]
pub struct MockPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    // Returned, in order, by the next enforcement calls.
    failures: Mutex<VecDeque<PlatformError>>,
    fail_always: Option<PlatformError>,
    delay: Option<Duration>,
    // Channel ID -> slowmode the channel currently has
    slowmodes: Mutex<HashMap<u64, u64>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(failures: Vec<PlatformError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..Default::default()
        }
    }

    pub fn always_failing(error: PlatformError) -> Self {
        Self {
            fail_always: Some(error),
            ..Default::default()
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Make the next enforcement call fail with `error`.
    pub fn fail_next(&self, error: PlatformError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Pretend the channel already has a slowmode, as if set before startup.
    pub fn set_current_slowmode(&self, channel_id: u64, seconds: u64) {
        self.slowmodes.lock().unwrap().insert(channel_id, seconds);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn enforcement_calls(&self) -> Vec<PlatformCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, PlatformCall::Notify { .. }))
            .collect()
    }

    pub fn notices(&self) -> Vec<(NotifyTarget, Notice)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlatformCall::Notify { target, notice } => Some((target, notice)),
                _ => None,
            })
            .collect()
    }

    async fn enforce(&self, call: PlatformCall) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_always {
            return Err(error.clone());
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn send_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
        duration_seconds: Option<u64>,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        self.enforce(PlatformCall::Punish {
            guild_id,
            user_id,
            action,
            duration_seconds,
        })
        .await
    }

    async fn revoke_punishment(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionType,
    ) -> Result<(), PlatformError> {
        self.enforce(PlatformCall::Revoke {
            guild_id,
            user_id,
            action,
        })
        .await
    }

    async fn set_slowmode(&self, channel_id: u64, seconds: u64) -> Result<(), PlatformError> {
        self.enforce(PlatformCall::Slowmode { channel_id, seconds })
            .await?;
        self.slowmodes.lock().unwrap().insert(channel_id, seconds);
        Ok(())
    }

    async fn current_slowmode(&self, channel_id: u64) -> Result<Option<u64>, PlatformError> {
        Ok(self.slowmodes.lock().unwrap().get(&channel_id).copied())
    }

    async fn lockdown(&self, guild_id: u64, _reason: &str) -> Result<(), PlatformError> {
        self.enforce(PlatformCall::Lockdown { guild_id }).await
    }

    async fn notify(&self, target: NotifyTarget, notice: &Notice) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(PlatformCall::Notify {
            target,
            notice: notice.clone(),
        });
        Ok(())
    }
}
