// Discord layer - platform adapter, event handlers and commands.

#[path = "moderation/mod.rs"]
pub mod moderation;

use crate::core::moderation::{ContentClassifier, ModerationPipeline};
use crate::infra::cases::SqliteCaseStore;
use crate::infra::policy::SqlitePolicyStore;
use moderation::SerenityPlatform;
use std::sync::Arc;

pub type Pipeline = ModerationPipeline<
    Box<dyn ContentClassifier>,
    SerenityPlatform,
    SqlitePolicyStore,
    SqliteCaseStore,
>;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared state handed to every command and event handler.
pub struct Data {
    pub moderation: Arc<Pipeline>,
}
