// Gateway events -> pipeline signals.

use super::formatter::parse_confirm_button;
use crate::core::moderation::{JoinSignal, MessageSignal, PipelineOutcome};
use crate::discord::Data;
use anyhow::Result;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{self as serenity, Context};
use tracing::{debug, info, warn};

fn to_chrono(ts: serenity::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

pub async fn handle_message(ctx: &Context, data: &Data, msg: &serenity::Message) -> Result<()> {
    if msg.author.bot {
        return Ok(());
    }
    let guild_id = match msg.guild_id {
        Some(id) => id.get(),
        None => return Ok(()),
    };

    let signal = MessageSignal {
        message_id: msg.id.get(),
        guild_id,
        channel_id: msg.channel_id.get(),
        author_id: msg.author.id.get(),
        author_name: msg.author.name.clone(),
        author_role_ids: msg
            .member
            .as_ref()
            .map(|m| m.roles.iter().map(|r| r.get()).collect())
            .unwrap_or_default(),
        content: msg.content.clone(),
        timestamp: to_chrono(msg.timestamp),
    };

    let outcome = data.moderation.handle_message(signal).await?;
    debug!(guild_id, message_id = msg.id.get(), ?outcome, "Message processed");

    // Remove the offending message once a case exists for it.
    if let PipelineOutcome::Executed { cases, .. } = &outcome {
        if !cases.is_empty() {
            if let Err(e) = msg.delete(&ctx.http).await {
                warn!(message_id = msg.id.get(), error = %e, "Failed to delete flagged message");
            }
        }
    }
    Ok(())
}

pub fn handle_message_delete(data: &Data, deleted_message_id: serenity::MessageId) {
    data.moderation.message_deleted(deleted_message_id.get());
}

pub async fn handle_member_join(data: &Data, member: &serenity::Member) -> Result<()> {
    if member.user.bot {
        return Ok(());
    }

    let signal = JoinSignal {
        guild_id: member.guild_id.get(),
        user_id: member.user.id.get(),
        account_created_at: to_chrono(member.user.id.created_at()),
        joined_at: member.joined_at.map(to_chrono).unwrap_or_else(Utc::now),
    };

    let outcome = data.moderation.handle_join(signal).await?;
    if let Some(raid) = &outcome.raid {
        info!(
            guild_id = raid.guild_id,
            joins = raid.join_count,
            "Raid response dispatched"
        );
    }
    Ok(())
}

async fn respond_ephemeral(
    ctx: &Context,
    component: &serenity::ComponentInteraction,
    content: impl Into<String>,
) -> Result<()> {
    component
        .create_response(
            &ctx.http,
            serenity::CreateInteractionResponse::Message(
                serenity::CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

/// Approve/Reject buttons on confirmation notices.
pub async fn handle_interaction(
    ctx: &Context,
    data: &Data,
    interaction: &serenity::Interaction,
) -> Result<()> {
    let serenity::Interaction::Component(component) = interaction else {
        return Ok(());
    };
    let Some((approve, request_id)) = parse_confirm_button(&component.data.custom_id) else {
        return Ok(());
    };
    let Some(guild_id) = component.guild_id else {
        return Ok(());
    };

    let can_moderate = component
        .member
        .as_ref()
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.contains(serenity::Permissions::MODERATE_MEMBERS));
    if !can_moderate {
        return respond_ephemeral(ctx, component, "You need the Moderate Members permission.").await;
    }

    let moderator_id = component.user.id.get();
    let outcome = match data
        .moderation
        .resolve_confirmation(guild_id.get(), request_id, moderator_id, approve)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return respond_ephemeral(ctx, component, format!("Could not resolve: {}", e)).await,
    };

    let summary = match &outcome {
        PipelineOutcome::Rejected(_) => format!("Rejected by <@{}>.", moderator_id),
        PipelineOutcome::Executed { cases, failures } if failures.is_empty() => format!(
            "Approved by <@{}>. Case(s): {}",
            moderator_id,
            cases
                .iter()
                .map(|c| format!("#{}", c.case_id))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        PipelineOutcome::Executed { failures, .. } => format!(
            "Approved by <@{}>, but execution failed: {}",
            moderator_id,
            failures.join("; ")
        ),
        other => format!("Resolved by <@{}>: {:?}", moderator_id, other),
    };

    component
        .create_response(
            &ctx.http,
            serenity::CreateInteractionResponse::UpdateMessage(
                serenity::CreateInteractionResponseMessage::new()
                    .content(summary)
                    .components(vec![]),
            ),
        )
        .await?;
    Ok(())
}
