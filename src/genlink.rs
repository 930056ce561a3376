use crate::{
    error::AppError,
    handlers::{schedule_auto_delete, user_mention, AppServices},
    store::{BatchManifest, StoredMessage},
    upload::{edit_status, with_retry},
};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use regex::Regex;
use std::sync::OnceLock;
use teloxide::{
    prelude::*,
    requests::Request,
    types::{Me, MessageId, ParseMode, Recipient},
    utils::html,
};
use tracing::{debug, info, instrument, warn};

const BATCH_STATUS_EVERY: usize = 20;
const MAX_BATCH_MESSAGES: i64 = 1000;
const FILE_PREFIX: &str = "file_";
const DSTORE_PREFIX: &str = "DSTORE-";
const BATCH_PREFIX: &str = "BATCH-";

const LINK_CODES: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn encode_payload(raw: &str) -> String {
    LINK_CODES.encode(raw)
}

pub fn decode_payload(code: &str) -> Option<String> {
    let bytes = LINK_CODES.decode(code.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartPayload {
    File(MessageId),
    Range {
        first: i32,
        last: i32,
        chat: ChatId,
        protect: bool,
    },
    Batch(String),
}

/// Size of `first..=last`, or `None` when the range is empty, starts below 1 or exceeds the batch cap.
pub fn range_len(first: i32, last: i32) -> Option<usize> {
    if first < 1 || last < first {
        return None;
    }
    let len = i64::from(last) - i64::from(first) + 1;
    (len <= MAX_BATCH_MESSAGES).then_some(len as usize)
}

pub fn dstore_raw(first: i32, last: i32, chat: ChatId, protect: bool) -> String {
    let cmd = if protect { "/pbatch" } else { "/batch" };
    format!("{first}_{last}_{}_{cmd}", chat.0)
}

pub fn parse_start_payload(payload: &str) -> Option<StartPayload> {
    let payload = payload.trim();
    if let Some(key) = payload.strip_prefix(BATCH_PREFIX) {
        return (!key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric()))
            .then(|| StartPayload::Batch(key.to_string()));
    }
    if let Some(code) = payload.strip_prefix(DSTORE_PREFIX) {
        let raw = decode_payload(code)?;
        let parts: Vec<&str> = raw.split('_').collect();
        let [first, last, chat, cmd] = parts.as_slice() else {
            return None;
        };
        let (first, last) = (first.parse::<i32>().ok()?, last.parse::<i32>().ok()?);
        range_len(first, last)?;
        return Some(StartPayload::Range {
            first,
            last,
            chat: ChatId(chat.parse().ok()?),
            protect: *cmd == "/pbatch",
        });
    }
    let raw = decode_payload(payload)?;
    let id = raw.strip_prefix(FILE_PREFIX)?.parse::<i32>().ok()?;
    (id > 0).then_some(StartPayload::File(MessageId(id)))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatRef {
    Id(ChatId),
    Username(String),
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:https?://)?(?:www\.)?(?:t\.me|telegram\.me|telegram\.dog)/(?:c/)?([A-Za-z0-9_]+)/(\d+)/?$")
            .expect("static regex must compile")
    })
}

/// Reads a `t.me` post link; numeric chats get the `-100` channel prefix.
pub fn parse_message_link(link: &str) -> Option<(ChatRef, i32)> {
    let caps = link_pattern().captures(link.trim())?;
    let message_id = caps[2].parse::<i32>().ok().filter(|id| *id > 0)?;
    let chat = &caps[1];
    let chat = if chat.chars().all(|c| c.is_ascii_digit()) {
        ChatRef::Id(ChatId(format!("-100{chat}").parse().ok()?))
    } else {
        ChatRef::Username(chat.to_string())
    };
    Some((chat, message_id))
}

pub fn share_links(services: &AppServices, me: &Me, code: &str) -> String {
    let mut text = format!("https://t.me/{}?start={code}", me.username());
    if let Some(site) = &services.config.website_url {
        text.push_str(&format!("\n\n🌐 Web link: {site}?start={code}"));
    }
    text
}

pub fn has_media(msg: &Message) -> bool {
    msg.document().is_some()
        || msg.video().is_some()
        || msg.audio().is_some()
        || msg.photo().is_some()
        || msg.animation().is_some()
        || msg.voice().is_some()
        || msg.video_note().is_some()
        || msg.sticker().is_some()
}

async fn ensure_can_store(bot: &Bot, services: &AppServices, msg: &Message) -> Result<bool, AppError> {
    if services.config.can_store_files(msg.from().map(|u| u.id)) {
        return Ok(true);
    }
    bot.send_message(msg.chat.id, "❌ You are not allowed to create links.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(false)
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn handle_link(bot: Bot, services: AppServices, msg: Message, me: Me) -> Result<(), AppError> {
    if !ensure_can_store(&bot, &services, &msg).await? {
        return Ok(());
    }
    let Some(replied) = msg.reply_to_message() else {
        bot.send_message(msg.chat.id, "Reply to a file with /link to get a shareable link.")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    };

    let db_channel = services.config.db_channel;
    let copied = with_retry(|| bot.copy_message(db_channel, msg.chat.id, replied.id).send()).await;
    let stored = match copied {
        Ok(stored) => stored,
        Err(err) => {
            warn!(event = "genlink_copy_failed", error = %err);
            let requester = msg.from().map(user_mention).unwrap_or_default();
            let _ = bot
                .send_message(
                    services.config.log_channel,
                    format!(
                        "#LINK_FAILED\nUser: {requester}\nError: {}",
                        html::escape(&err.to_string())
                    ),
                )
                .parse_mode(ParseMode::Html)
                .await;
            bot.send_message(msg.chat.id, "❌ Failed to store the file. Try again later.")
                .reply_to_message_id(msg.id)
                .await?;
            return Ok(());
        }
    };

    let code = encode_payload(&format!("{FILE_PREFIX}{}", stored.0));
    let links = share_links(&services, &me, &code);
    info!(event = "genlink_file_link_created", stored = stored.0);
    bot.send_message(msg.chat.id, format!("✅ Here is your link:\n\n{links}"))
        .reply_to_message_id(msg.id)
        .disable_web_page_preview(true)
        .await?;

    let requester = msg.from().map(user_mention).unwrap_or_default();
    if let Err(err) = bot
        .send_message(
            services.config.log_channel,
            format!("#LINK\nUser: {requester}\nLink: {links}"),
        )
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .await
    {
        warn!(event = "genlink_log_failed", error = %err);
    }
    Ok(())
}

async fn resolve_chat(bot: &Bot, chat: &ChatRef) -> Result<ChatId, AppError> {
    let recipient = match chat {
        ChatRef::Id(id) => Recipient::Id(*id),
        ChatRef::Username(name) => Recipient::ChannelUsername(format!("@{name}")),
    };
    Ok(bot.get_chat(recipient).await?.id)
}

fn batch_progress_text(total: usize, done: usize, stored: usize) -> String {
    format!(
        "Total messages: {total}\nDone: {done}\nRemaining: {}\nFiles stored: {stored}\nStatus: Saving...",
        total.saturating_sub(done)
    )
}

#[instrument(skip_all, fields(chat = %msg.chat.id, protect = protect))]
pub async fn handle_batch(
    bot: Bot,
    services: AppServices,
    msg: Message,
    me: Me,
    args: String,
    protect: bool,
) -> Result<(), AppError> {
    if !ensure_can_store(&bot, &services, &msg).await? {
        return Ok(());
    }
    let links: Vec<&str> = args.split_whitespace().collect();
    let parsed = match links.as_slice() {
        [first, last] => parse_message_link(first).zip(parse_message_link(last)),
        _ => {
            bot.send_message(
                msg.chat.id,
                "Use the correct format.\nExample: /batch https://t.me/channel/10 https://t.me/channel/20",
            )
            .reply_to_message_id(msg.id)
            .await?;
            return Ok(());
        }
    };
    let Some(((first_chat, first), (last_chat, last))) = parsed else {
        bot.send_message(msg.chat.id, "❌ Invalid link.")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    };
    let problem = if first_chat != last_chat {
        Some("❌ Chat ids not matched.".to_string())
    } else if first > last {
        Some("❌ The first link must point to an earlier message than the last one.".to_string())
    } else if range_len(first, last).is_none() {
        Some(format!("❌ A batch can hold at most {MAX_BATCH_MESSAGES} messages."))
    } else {
        None
    };
    if let Some(problem) = problem {
        bot.send_message(msg.chat.id, problem)
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }

    let chat_id = match resolve_chat(&bot, &first_chat).await {
        Ok(chat_id) => chat_id,
        Err(err) => {
            warn!(event = "genlink_chat_lookup_failed", error = %err);
            bot.send_message(
                msg.chat.id,
                "❌ This may be a private channel or group. Make me an admin there to index the files.",
            )
            .reply_to_message_id(msg.id)
            .await?;
            return Ok(());
        }
    };

    let status = bot
        .send_message(
            msg.chat.id,
            "⏳ Generating a link for your messages.\nThis may take a while depending on how many there are.",
        )
        .reply_to_message_id(msg.id)
        .await?;

    if services.config.is_file_store(chat_id) {
        let code = format!("{DSTORE_PREFIX}{}", encode_payload(&dstore_raw(first, last, chat_id, protect)));
        edit_status(&bot, msg.chat.id, status.id, format!("✅ Here is your link:\n\n{}", share_links(&services, &me, &code))).await;
        info!(event = "genlink_dstore_link_created", chat = %chat_id, first, last);
        return Ok(());
    }

    let db_channel = services.config.db_channel;
    let Some(total) = range_len(first, last) else {
        return Ok(());
    };
    let mut items = Vec::new();
    for (done, id) in (first..=last).enumerate() {
        let forwarded = with_retry(|| bot.forward_message(db_channel, chat_id, MessageId(id)).send()).await;
        match forwarded {
            Ok(copy) if has_media(&copy) => items.push(StoredMessage {
                chat_id: db_channel.0,
                message_id: copy.id.0,
            }),
            Ok(copy) => {
                if let Err(err) = bot.delete_message(db_channel, copy.id).await {
                    debug!(event = "genlink_non_media_delete_failed", error = %err);
                }
            }
            Err(err) => debug!(event = "genlink_forward_skipped", message = id, error = %err),
        }
        if (done + 1) % BATCH_STATUS_EVERY == 0 {
            edit_status(&bot, msg.chat.id, status.id, batch_progress_text(total, done + 1, items.len())).await;
        }
    }

    if items.is_empty() {
        edit_status(&bot, msg.chat.id, status.id, "❌ No files found in that range.").await;
        return Ok(());
    }
    let count = items.len();
    let key = services.batches.insert(BatchManifest { protect, items }).await?;
    info!(event = "genlink_batch_link_created", key = %key, files = count);
    let links = share_links(&services, &me, &format!("{BATCH_PREFIX}{key}"));
    edit_status(
        &bot,
        msg.chat.id,
        status.id,
        format!("✅ Here is your link.\nContains {count} files.\n\n{links}"),
    )
    .await;
    Ok(())
}

async fn copy_to_user(bot: &Bot, to: ChatId, from: ChatId, id: MessageId, protect: bool) -> Option<MessageId> {
    match with_retry(|| bot.copy_message(to, from, id).protect_content(protect).send()).await {
        Ok(copied) => Some(copied),
        Err(err) => {
            debug!(event = "genlink_copy_skipped", from = %from, message = id.0, error = %err);
            None
        }
    }
}

async fn reply_invalid(bot: &Bot, msg: &Message) -> Result<(), AppError> {
    bot.send_message(msg.chat.id, "❌ Invalid link")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn handle_start(bot: Bot, services: AppServices, msg: Message, me: Me, payload: String) -> Result<(), AppError> {
    let payload = payload.trim();
    if payload.is_empty() {
        let name = msg.from().map(user_mention).unwrap_or_else(|| "there".to_string());
        bot.send_message(
            msg.chat.id,
            format!(
                "👋 Hello {name}!\n\nI am <b>{}</b>. I can search Library Genesis, download YouTube audio and video, \
                 rename your files and share files through links.\n\nSend /help to see every command.",
                html::escape(&me.user.first_name)
            ),
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
        return Ok(());
    }

    let Some(parsed) = parse_start_payload(payload) else {
        reply_invalid(&bot, &msg).await?;
        return Ok(());
    };

    let chat_id = msg.chat.id;
    let mut delivered = Vec::new();
    match parsed {
        StartPayload::File(id) => {
            delivered.extend(copy_to_user(&bot, chat_id, services.config.db_channel, id, false).await);
        }
        StartPayload::Range {
            first,
            last,
            chat,
            protect,
        } => {
            if !services.config.is_file_store(chat) || range_len(first, last).is_none() {
                reply_invalid(&bot, &msg).await?;
                return Ok(());
            }
            for id in first..=last {
                delivered.extend(copy_to_user(&bot, chat_id, chat, MessageId(id), protect).await);
            }
        }
        StartPayload::Batch(key) => {
            let Some(manifest) = services.batches.get(&key).await else {
                reply_invalid(&bot, &msg).await?;
                return Ok(());
            };
            for item in manifest.items {
                delivered.extend(
                    copy_to_user(&bot, chat_id, ChatId(item.chat_id), MessageId(item.message_id), manifest.protect).await,
                );
            }
        }
    }

    if delivered.is_empty() {
        bot.send_message(chat_id, "❌ The files behind this link are no longer available.")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }
    info!(event = "genlink_delivered", files = delivered.len());
    if let Some(delay) = services.config.auto_delete {
        schedule_auto_delete(&bot, chat_id, delivered, delay).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_url_safe_without_padding() {
        assert_eq!(encode_payload("file_123"), "ZmlsZV8xMjM");
        assert_eq!(decode_payload("ZmlsZV8xMjM").as_deref(), Some("file_123"));
        assert_eq!(decode_payload("ZmlsZV8xMjM=").as_deref(), Some("file_123"));
        assert_eq!(decode_payload("%%%"), None);
        assert!(!encode_payload("??>>").contains(['+', '/', '=']));
    }

    #[test]
    fn start_payloads_decode_to_their_kind() {
        let file = encode_payload("file_55");
        assert_eq!(parse_start_payload(&file), Some(StartPayload::File(MessageId(55))));

        let range = format!("DSTORE-{}", encode_payload(&dstore_raw(10, 20, ChatId(-1001234), true)));
        assert_eq!(
            parse_start_payload(&range),
            Some(StartPayload::Range {
                first: 10,
                last: 20,
                chat: ChatId(-1001234),
                protect: true
            })
        );

        assert_eq!(
            parse_start_payload("BATCH-abcDEF123456"),
            Some(StartPayload::Batch("abcDEF123456".into()))
        );
    }

    #[test]
    fn malformed_start_payloads_are_rejected() {
        assert_eq!(parse_start_payload("%%%"), None);
        assert_eq!(parse_start_payload(&encode_payload("photo_5")), None);
        assert_eq!(parse_start_payload("BATCH-"), None);
        assert_eq!(parse_start_payload("BATCH-../x"), None);
        let reversed = format!("DSTORE-{}", encode_payload("20_10_-100_/batch"));
        assert_eq!(parse_start_payload(&reversed), None);
    }

    #[test]
    fn message_links_resolve_chat_and_id() {
        assert_eq!(
            parse_message_link("https://t.me/c/1234567/10"),
            Some((ChatRef::Id(ChatId(-1001234567)), 10))
        );
        assert_eq!(
            parse_message_link("t.me/some_channel/5"),
            Some((ChatRef::Username("some_channel".into()), 5))
        );
        assert_eq!(parse_message_link("https://example.com/chan/1"), None);
        assert_eq!(parse_message_link("https://t.me/chan"), None);
        assert_eq!(parse_message_link("https://t.me/c/1/0"), None);
        assert_eq!(parse_message_link("https://t.me/c/1/2147483648"), None);
    }

    #[test]
    fn range_length_stays_within_the_cap() {
        assert_eq!(range_len(1, 1), Some(1));
        assert_eq!(range_len(10, 1009), Some(1000));
        assert_eq!(range_len(10, 1010), None);
        assert_eq!(range_len(1, i32::MAX), None);
        assert_eq!(range_len(i32::MIN, i32::MAX), None);
        assert_eq!(range_len(0, 5), None);
        assert_eq!(range_len(5, 4), None);
    }

    #[test]
    fn out_of_range_message_ids_are_rejected() {
        let full_span = format!("DSTORE-{}", encode_payload(&format!("{}_{}_-1001_/batch", i32::MIN, i32::MAX)));
        assert_eq!(parse_start_payload(&full_span), None);
        let negative = format!("DSTORE-{}", encode_payload("-5_3_-1001_/batch"));
        assert_eq!(parse_start_payload(&negative), None);
        let too_wide = format!("DSTORE-{}", encode_payload(&dstore_raw(1, 2_000_000, ChatId(-1001), false)));
        assert_eq!(parse_start_payload(&too_wide), None);
        assert_eq!(parse_start_payload(&encode_payload("file_0")), None);
        assert_eq!(parse_start_payload(&encode_payload("file_-3")), None);
    }

    #[test]
    fn batch_progress_counts_remaining() {
        let text = batch_progress_text(50, 20, 7);
        assert!(text.contains("Total messages: 50"));
        assert!(text.contains("Remaining: 30"));
        assert!(text.contains("Files stored: 7"));
    }
}
