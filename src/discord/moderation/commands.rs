// Moderation slash commands: cases, appeals, verification and policy.

use super::formatter::{appeal_embed, case_embed};
use crate::core::cases::AppealStatus;
use crate::core::moderation::VerificationSignal;
use crate::core::policy::PolicySection;
use crate::core::verification::VerificationOutcome;
use crate::discord::{Context, Error};
use chrono::Utc;
use poise::serenity_prelude as serenity;
use uuid::Uuid;

const HISTORY_LIMIT: u32 = 10;

async fn reply_ephemeral(ctx: Context<'_>, content: impl Into<String>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

// ============================================================================
// CASES
// ============================================================================

/// Look up moderation cases.
#[poise::command(
    slash_command,
    subcommands("view", "history"),
    required_permissions = "MODERATE_MEMBERS",
    guild_only
)]
pub async fn case(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show a single case.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn view(
    ctx: Context<'_>,
    #[description = "Case number"] id: u64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    match ctx.data().moderation.get_case(guild_id.get(), id).await {
        Ok(case) => {
            ctx.send(poise::CreateReply::default().embed(case_embed(&case)))
                .await?;
        }
        Err(e) => reply_ephemeral(ctx, format!("❌ {}", e)).await?,
    }
    Ok(())
}

/// Show a member's most recent cases.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn history(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let cases = ctx
        .data()
        .moderation
        .user_history(guild_id.get(), user.id.get(), HISTORY_LIMIT)
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    if cases.is_empty() {
        return reply_ephemeral(ctx, format!("{} has a clean record.", user.name)).await;
    }

    let lines: Vec<String> = cases
        .iter()
        .map(|c| {
            format!(
                "**#{}** {} ({}) <t:{}:R>\n{}",
                c.case_id,
                c.action_type,
                c.status.as_str(),
                c.created_at.timestamp(),
                c.reason
            )
        })
        .collect();

    let embed = serenity::CreateEmbed::new()
        .title(format!("Case history for {}", user.name))
        .description(lines.join("\n\n"))
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

// ============================================================================
// APPEALS
// ============================================================================

/// Appeal your most recent moderation action.
#[poise::command(slash_command, guild_only)]
pub async fn appeal(
    ctx: Context<'_>,
    #[description = "Why should the action be lifted?"] reason: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    match ctx
        .data()
        .moderation
        .submit_appeal(guild_id.get(), ctx.author().id.get(), reason)
        .await
    {
        Ok(appeal) => {
            reply_ephemeral(
                ctx,
                format!(
                    "✅ Appeal submitted for case #{}. The moderators will review it.",
                    appeal.original_case.case_id
                ),
            )
            .await
        }
        Err(e) => reply_ephemeral(ctx, format!("❌ {}", e)).await,
    }
}

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum AppealDecision {
    Approve,
    Deny,
}

/// Review member appeals.
#[poise::command(
    slash_command,
    subcommands("list", "resolve"),
    required_permissions = "MODERATE_MEMBERS",
    guild_only
)]
pub async fn appeals(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// List pending appeals.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let pending = ctx
        .data()
        .moderation
        .pending_appeals(guild_id.get())
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    if pending.is_empty() {
        return reply_ephemeral(ctx, "No pending appeals.").await;
    }

    // Discord allows at most 10 embeds per message.
    let mut reply = poise::CreateReply::default().ephemeral(true);
    for appeal in pending.iter().take(10) {
        reply = reply.embed(appeal_embed(appeal));
    }
    ctx.send(reply).await?;
    Ok(())
}

/// Approve or deny an appeal.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn resolve(
    ctx: Context<'_>,
    #[description = "Appeal ID"] id: String,
    #[description = "Decision"] decision: AppealDecision,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let Ok(appeal_id) = Uuid::parse_str(id.trim()) else {
        return reply_ephemeral(ctx, "❌ That is not a valid appeal ID.").await;
    };
    let status = match decision {
        AppealDecision::Approve => AppealStatus::Approved,
        AppealDecision::Deny => AppealStatus::Denied,
    };

    match ctx
        .data()
        .moderation
        .resolve_appeal(guild_id.get(), appeal_id, status, ctx.author().id.get())
        .await
    {
        Ok(appeal) => {
            ctx.send(poise::CreateReply::default().embed(appeal_embed(&appeal)))
                .await?;
            Ok(())
        }
        Err(e) => reply_ephemeral(ctx, format!("❌ {}", e)).await,
    }
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// Complete server verification with the code you received.
#[poise::command(slash_command, guild_only)]
pub async fn verify(
    ctx: Context<'_>,
    #[description = "Verification code from your DMs"] token: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let signal = VerificationSignal {
        guild_id: guild_id.get(),
        user_id: ctx.author().id.get(),
        token: token.trim().to_string(),
        submitted_at: Utc::now(),
    };

    let message = match ctx.data().moderation.handle_verification(signal).await {
        Ok((VerificationOutcome::Verified, _)) => "✅ You are verified. Welcome!".to_string(),
        Ok((VerificationOutcome::Retry { remaining_attempts }, _)) => format!(
            "❌ That code is wrong. {} attempt(s) left.",
            remaining_attempts
        ),
        Ok((VerificationOutcome::Failed(_), _)) => {
            "❌ Verification failed too many times.".to_string()
        }
        Err(e) => format!("❌ {}", e),
    };
    reply_ephemeral(ctx, message).await
}

// ============================================================================
// POLICY
// ============================================================================

/// Automated moderation policy.
#[poise::command(
    slash_command,
    subcommands("show", "set"),
    required_permissions = "MANAGE_GUILD",
    guild_only
)]
pub async fn automod(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

fn parse_section(section: &str) -> Result<PolicySection, Error> {
    section.parse::<PolicySection>().map_err(|e| {
        let known: Vec<&str> = PolicySection::ALL.iter().map(|s| s.as_str()).collect();
        Error::from(format!("{} (known: {})", e, known.join(", ")))
    })
}

/// Show one policy section as JSON.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn show(
    ctx: Context<'_>,
    #[description = "Section, e.g. moderation or raid_defense"] section: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let section = parse_section(&section)?;

    let snapshot = ctx
        .data()
        .moderation
        .policies()
        .snapshot(guild_id.get())
        .await
        .map_err(|e| Error::from(e.to_string()))?;
    let value = snapshot
        .policy
        .section_value(section)
        .map_err(|e| Error::from(e.to_string()))?;
    let pretty = serde_json::to_string_pretty(&value).map_err(|e| Error::from(e.to_string()))?;

    reply_ephemeral(
        ctx,
        format!(
            "**{}** (revision {})\n```json\n{}\n```",
            section, snapshot.revision, pretty
        ),
    )
    .await
}

/// Replace one policy section with a JSON document.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Section, e.g. moderation or raid_defense"] section: String,
    #[description = "JSON document for the section"] document: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let section = parse_section(&section)?;
    let value: serde_json::Value = match serde_json::from_str(&document) {
        Ok(value) => value,
        Err(e) => return reply_ephemeral(ctx, format!("❌ Invalid JSON: {}", e)).await,
    };

    match ctx
        .data()
        .moderation
        .policies()
        .save_section(guild_id.get(), section, value)
        .await
    {
        Ok(()) => reply_ephemeral(ctx, format!("✅ Updated **{}**.", section)).await,
        Err(e) => reply_ephemeral(ctx, format!("❌ {}", e)).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_names_accept_dashes_and_case() {
        assert_eq!(parse_section("Raid-Defense").ok(), Some(PolicySection::RaidDefense));
        assert!(parse_section("nonsense").is_err());
    }
}
