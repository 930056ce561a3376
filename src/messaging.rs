use crate::{error::AppError, handlers::AppServices};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use teloxide::{
    prelude::*,
    types::{ParseMode, Recipient, User},
    utils::html,
};
use tracing::{info, instrument, warn};

fn uid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#UID(\d+)#").expect("static regex must compile"))
}

/// Finds the `#UID<id>#` tag that relay headers carry.
pub fn extract_user_id(text: &str) -> Option<UserId> {
    uid_pattern()
        .captures(text)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .map(UserId)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Target {
    Id(ChatId),
    Username(String),
}

/// Splits `<user_id|@username> <text>` as typed by an admin.
pub fn parse_admin_message(args: &str) -> Option<(Target, String)> {
    let (target, text) = args.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let target = match target.parse::<i64>() {
        Ok(id) => Target::Id(ChatId(id)),
        Err(_) => Target::Username(target.trim_start_matches('@').to_string()),
    };
    Some((target, text.to_string()))
}

pub fn relay_time(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn relay_header(user: &User, date: &str) -> String {
    format!(
        "📩 <b>#message from user</b>\n\
         👤 Name: {}\n\
         🆔 User ID: <code>{id}</code> #UID{id}#\n\
         📱 Username: {}\n\
         ⏰ Time: {date}\n\
         ➖➖➖➖➖➖➖➖",
        html::escape(&user.full_name()),
        user.username
            .as_deref()
            .map(|u| format!("@{u}"))
            .unwrap_or_else(|| "N/A".to_string()),
        id = user.id,
    )
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn handle_message_command(bot: Bot, services: AppServices, msg: Message, args: String) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if services.config.is_admin(user.id) {
        send_as_admin(&bot, &msg, &args).await
    } else if msg.chat.is_private() {
        send_to_admins(&bot, &services, &msg, user, &args).await
    } else {
        Ok(())
    }
}

async fn send_as_admin(bot: &Bot, msg: &Message, args: &str) -> Result<(), AppError> {
    let Some((target, text)) = parse_admin_message(args) else {
        bot.send_message(
            msg.chat.id,
            "Usage: <code>/message user_id|@username text</code>",
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
        return Ok(());
    };

    let chat_id = match target {
        Target::Id(id) => id,
        Target::Username(username) => match bot.get_chat(Recipient::ChannelUsername(format!("@{username}"))).await {
            Ok(chat) => chat.id,
            Err(err) => {
                warn!(event = "relay_username_lookup_failed", username = %username, error = %err);
                bot.send_message(msg.chat.id, format!("❌ Couldn't find a user @{username}."))
                    .reply_to_message_id(msg.id)
                    .await?;
                return Ok(());
            }
        },
    };

    let reply = match bot.send_message(chat_id, text).await {
        Ok(_) => {
            info!(event = "relay_admin_message_sent", target = %chat_id);
            format!("✅ Message sent to {chat_id}!")
        }
        Err(err) => {
            warn!(event = "relay_admin_message_failed", target = %chat_id, error = %err);
            format!("❌ Could not deliver the message to {chat_id}.\nError: {err}")
        }
    };
    bot.send_message(msg.chat.id, reply)
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

async fn send_to_admins(bot: &Bot, services: &AppServices, msg: &Message, user: &User, text: &str) -> Result<(), AppError> {
    let text = text.trim();
    if text.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Usage: <code>/message your text</code>\nThe admins will reply here.",
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
        return Ok(());
    }
    let body = format!("{}\n\n{}", relay_header(user, &relay_time(msg.date)), html::escape(text));
    bot.send_message(services.config.log_channel, body)
        .parse_mode(ParseMode::Html)
        .await?;
    info!(event = "relay_user_message_forwarded", user = %user.id);
    bot.send_message(msg.chat.id, "✅ Your message has been sent to the admins.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

pub fn is_log_channel_reply(msg: Message, services: AppServices) -> bool {
    msg.chat.id == services.config.log_channel && msg.reply_to_message().is_some()
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn route_admin_reply(bot: Bot, msg: Message) -> Result<(), AppError> {
    let Some(replied) = msg.reply_to_message() else {
        return Ok(());
    };
    let original = replied.text().or_else(|| replied.caption()).unwrap_or_default();
    let Some(user_id) = extract_user_id(original) else {
        bot.send_message(msg.chat.id, "❌ Couldn't find a user ID in the original message.")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    };
    let Some(answer) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };

    let delivered = bot
        .send_message(
            ChatId(user_id.0 as i64),
            format!("📬 <b>Admin Reply:</b>\n\n{}", html::escape(answer)),
        )
        .parse_mode(ParseMode::Html)
        .await;
    let status = match delivered {
        Ok(_) => {
            info!(event = "relay_reply_routed", user = %user_id);
            format!("✅ Reply sent to user {user_id}")
        }
        Err(err) => {
            warn!(event = "relay_reply_failed", user = %user_id, error = %err);
            format!("❌ Could not deliver the reply to {user_id}.\nError: {err}")
        }
    };
    bot.send_message(msg.chat.id, status)
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_tag_is_extracted() {
        assert_eq!(extract_user_id("🆔 User ID: 42 #UID42#\nhello"), Some(UserId(42)));
        assert_eq!(extract_user_id("#UID# missing"), None);
        assert_eq!(extract_user_id("no tag at all"), None);
    }

    #[test]
    fn admin_arguments_split_target_and_text() {
        assert_eq!(
            parse_admin_message("12345 hello there"),
            Some((Target::Id(ChatId(12345)), "hello there".into()))
        );
        assert_eq!(
            parse_admin_message("@someone  hi"),
            Some((Target::Username("someone".into()), "hi".into()))
        );
        assert_eq!(parse_admin_message("12345"), None);
        assert_eq!(parse_admin_message(""), None);
    }

    #[test]
    fn relay_time_is_rendered_in_utc() {
        let date = DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap();
        assert_eq!(relay_time(date), "2024-01-01 00:00:00 UTC");
    }

    #[test]
    fn header_round_trips_user_id() {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": 777,
            "is_bot": false,
            "first_name": "Ada",
            "last_name": "<L>"
        }))
        .unwrap();
        let header = relay_header(&user, "2024-01-01 00:00:00 UTC");
        assert_eq!(extract_user_id(&header), Some(UserId(777)));
        assert!(header.contains("Ada &lt;L&gt;"));
        assert!(header.contains("Username: N/A"));
    }
}
