use crate::core::cases::{Appeal, Case, Moderator};
use crate::core::enforcement::{Notice, NoticeLevel};
use poise::serenity_prelude::{
    self as serenity, CreateActionRow, CreateButton, CreateEmbed, CreateEmbedFooter, CreateMessage,
};
use uuid::Uuid;

/// Custom-id prefix of confirmation buttons.
pub const CONFIRM_PREFIX: &str = "modconfirm";

pub fn confirm_button_id(approve: bool, request_id: Uuid) -> String {
    let verb = if approve { "approve" } else { "reject" };
    format!("{}:{}:{}", CONFIRM_PREFIX, verb, request_id)
}

/// Parse `modconfirm:<approve|reject>:<uuid>`.
pub fn parse_confirm_button(custom_id: &str) -> Option<(bool, Uuid)> {
    let mut parts = custom_id.splitn(3, ':');
    if parts.next()? != CONFIRM_PREFIX {
        return None;
    }
    let approve = match parts.next()? {
        "approve" => true,
        "reject" => false,
        _ => return None,
    };
    let request_id = Uuid::parse_str(parts.next()?).ok()?;
    Some((approve, request_id))
}

fn level_color(level: NoticeLevel) -> serenity::Color {
    match level {
        NoticeLevel::Info => serenity::Color::BLUE,
        NoticeLevel::Warning => serenity::Color::from_rgb(255, 165, 0), // Orange
        NoticeLevel::Alert => serenity::Color::RED,
    }
}

pub fn notice_embed(notice: &Notice) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title(&notice.title)
        .description(&notice.description)
        .color(level_color(notice.level))
        .timestamp(serenity::Timestamp::now());
    for (name, value) in &notice.fields {
        embed = embed.field(name, value, false);
    }
    if let Some(request_id) = notice.confirmation_request {
        embed = embed.footer(CreateEmbedFooter::new(format!("Request {}", request_id)));
    }
    embed
}

pub fn notice_message(notice: &Notice) -> CreateMessage {
    let mut message = CreateMessage::new().embed(notice_embed(notice));
    if let Some(role_id) = notice.mention_role {
        message = message.content(format!("<@&{}>", role_id));
    }
    if let Some(request_id) = notice.confirmation_request {
        message = message.components(vec![CreateActionRow::Buttons(vec![
            CreateButton::new(confirm_button_id(true, request_id))
                .label("Approve")
                .style(serenity::ButtonStyle::Success),
            CreateButton::new(confirm_button_id(false, request_id))
                .label("Reject")
                .style(serenity::ButtonStyle::Danger),
        ])]);
    }
    message
}

pub fn case_embed(case: &Case) -> CreateEmbed {
    let moderator = match case.moderator {
        Moderator::System => "Automod".to_string(),
        Moderator::User(id) => format!("<@{}>", id),
    };
    let target = if case.target_user_id == 0 {
        case.channel_id
            .map_or_else(|| "Server".to_string(), |c| format!("<#{}>", c))
    } else {
        format!("<@{}>", case.target_user_id)
    };

    let created = serenity::Timestamp::from_unix_timestamp(case.created_at.timestamp())
        .unwrap_or_else(|_| serenity::Timestamp::now());

    let mut embed = CreateEmbed::default()
        .title(format!("Case #{} | {}", case.case_id, case.action_type))
        .description(&case.reason)
        .color(serenity::Color::DARK_RED)
        .field("Target", target, true)
        .field("Moderator", moderator, true)
        .field("Status", case.status.as_str(), true)
        .footer(CreateEmbedFooter::new(format!("Source: {}", case.source_event_id)))
        .timestamp(created);
    if let Some(rule) = &case.rule_violated {
        embed = embed.field("Rule", rule, true);
    }
    if let Some(duration) = case.duration_seconds {
        embed = embed.field("Duration", format!("{}s", duration), true);
    }
    embed
}

pub fn appeal_embed(appeal: &Appeal) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("Appeal {}", appeal.appeal_id))
        .description(&appeal.reason)
        .color(serenity::Color::BLUE)
        .field("Member", format!("<@{}>", appeal.target_user_id), true)
        .field(
            "Case",
            format!(
                "#{} ({})",
                appeal.original_case.case_id, appeal.original_case.action_type
            ),
            true,
        )
        .field("Status", appeal.status.as_str(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_button_ids_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_confirm_button(&confirm_button_id(true, id)),
            Some((true, id))
        );
        assert_eq!(
            parse_confirm_button(&confirm_button_id(false, id)),
            Some((false, id))
        );
    }

    #[test]
    fn unrelated_buttons_are_ignored() {
        assert_eq!(parse_confirm_button("ticket:open:1"), None);
        assert_eq!(parse_confirm_button("modconfirm:maybe:abc"), None);
        assert_eq!(parse_confirm_button("modconfirm:approve:not-a-uuid"), None);
    }
}
