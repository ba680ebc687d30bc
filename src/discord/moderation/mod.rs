// Moderation adapter: Discord events in, platform actions out.

pub mod commands;
pub mod events;
pub mod formatter;
pub mod serenity_platform;

pub use serenity_platform::SerenityPlatform;
