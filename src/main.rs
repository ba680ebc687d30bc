// Entry point of the automated moderation bot.
//
// **Architecture Overview:**
// - `core/` = Moderation pipeline (platform-agnostic)
// - `infra/` = Implementations of core traits (SQLite stores, classifier API)
// - `discord/` = Discord-specific adapters (platform, commands, events)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework
// 4. Register commands, event handlers and the monitor loop

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::enforcement::ExecutorConfig;
use crate::core::moderation::{ContentClassifier, ModerationPipeline, PipelineConfig};
use crate::discord::moderation::{commands, events, SerenityPlatform};
use crate::discord::{Data, Error};
use crate::infra::ai::{ClassifierSettings, OpenRouterClassifier, UnconfiguredClassifier};
use crate::infra::cases::SqliteCaseStore;
use crate::infra::policy::SqlitePolicyStore;
use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Read an env var, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}

/// Event handler for non-command Discord events.
async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if let Err(e) = events::handle_message(ctx, data, new_message).await {
                tracing::error!(message_id = new_message.id.get(), error = %e, "Message pipeline failed");
            }
        }
        serenity::FullEvent::MessageDelete {
            deleted_message_id,
            ..
        } => {
            events::handle_message_delete(data, *deleted_message_id);
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = events::handle_member_join(data, new_member).await {
                tracing::error!(
                    guild_id = new_member.guild_id.get(),
                    user_id = new_member.user.id.get(),
                    error = %e,
                    "Join pipeline failed"
                );
            }
        }
        serenity::FullEvent::InteractionCreate { interaction } => {
            if let Err(e) = events::handle_interaction(ctx, data, interaction).await {
                tracing::error!(error = %e, "Confirmation interaction failed");
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    let token = std::env::var("DISCORD_TOKEN").context(
        "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
    )?;

    // Keep runtime databases in a dedicated folder so the repo root stays tidy.
    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
    let db_path = format!("{}/automod.db", data_dir);

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", db_path))
        .await
        .context("Failed to connect to moderation DB")?;

    let policy_store = SqlitePolicyStore::new(pool.clone());
    policy_store
        .migrate()
        .await
        .context("Failed to migrate policy tables")?;
    let case_store = SqliteCaseStore::new(pool);
    case_store
        .migrate()
        .await
        .context("Failed to migrate case tables")?;

    let classifier: Box<dyn ContentClassifier> = match std::env::var("OPENROUTER_API_KEY") {
        Ok(api_key) if !api_key.trim().is_empty() => {
            let mut settings = ClassifierSettings::default();
            if let Ok(model) = std::env::var("CLASSIFIER_MODEL") {
                settings.model = model;
            }
            tracing::info!(model = %settings.model, "Content classifier enabled");
            Box::new(OpenRouterClassifier::new(api_key, settings))
        }
        _ => {
            tracing::warn!("OPENROUTER_API_KEY not set; running without content classification");
            Box::new(UnconfiguredClassifier)
        }
    };

    let config = PipelineConfig {
        classifier_timeout: Duration::from_secs(env_or("CLASSIFIER_TIMEOUT_SECS", 10)),
        executor: ExecutorConfig {
            max_attempts: env_or("ACTION_MAX_ATTEMPTS", 4),
            call_timeout: Duration::from_secs(env_or("PLATFORM_TIMEOUT_SECS", 10)),
            ..ExecutorConfig::default()
        },
    };
    let monitor_tick = Duration::from_secs(env_or("MONITOR_TICK_SECS", 5u64).max(1));

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required to read message content
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                commands::case(),
                commands::appeal(),
                commands::appeals(),
                commands::verify(),
                commands::automod(),
            ],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                tracing::info!("Bot is starting up");

                // Register slash commands globally (can take up to an hour to propagate)
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!("Commands registered");

                let platform = Arc::new(SerenityPlatform::new(ctx.http.clone()));
                let pipeline = Arc::new(ModerationPipeline::new(
                    classifier,
                    platform,
                    policy_store,
                    case_store,
                    config,
                ));

                // Background monitor: channel rates, raid expiry, housekeeping.
                let monitor = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(monitor_tick);
                    loop {
                        interval.tick().await;
                        monitor.run_monitor_tick(chrono::Utc::now()).await;
                    }
                });

                Ok(Data {
                    moderation: pipeline,
                })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .context("Error creating client")?;

    client.start().await.context("Error running bot")?;
    Ok(())
}
