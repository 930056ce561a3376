use crate::{
    error::AppError,
    handlers::{random_suffix, AppServices},
    progress::{format_duration, human_size, StatusUpdates, TransferProgress},
    upload::{report_user_error, upload_with_progress, Outgoing, UploadKind},
};
use dashmap::DashMap;
use futures_util::StreamExt;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};
use teloxide::{
    net::Download,
    prelude::*,
    types::{ForceReply, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, PhotoSize},
    utils::html,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

const DEFAULT_CAPTION: &str = "<b>{filename}</b>";
const UPLOAD_CALLBACK_PREFIX: &str = "upload_";
const CANCEL_CALLBACK: &str = "cancel";
const THUMB_MAX_SIDE: u32 = 320;

/// The file fields a rename needs, whatever kind of media carried them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub file_id: String,
    pub file_name: Option<String>,
    pub size: u64,
    pub duration: Option<u32>,
    pub thumb_id: Option<String>,
}

pub fn media_of(msg: &Message) -> Option<MediaInfo> {
    if let Some(doc) = msg.document() {
        return Some(MediaInfo {
            file_id: doc.file.id.clone(),
            file_name: doc.file_name.clone(),
            size: u64::from(doc.file.size),
            duration: None,
            thumb_id: doc.thumb.as_ref().map(|t| t.file.id.clone()),
        });
    }
    if let Some(video) = msg.video() {
        return Some(MediaInfo {
            file_id: video.file.id.clone(),
            file_name: video.file_name.clone(),
            size: u64::from(video.file.size),
            duration: Some(video.duration),
            thumb_id: video.thumb.as_ref().map(|t| t.file.id.clone()),
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(MediaInfo {
            file_id: audio.file.id.clone(),
            file_name: audio.file_name.clone(),
            size: u64::from(audio.file.size),
            duration: Some(audio.duration),
            thumb_id: audio.thumb.as_ref().map(|t| t.file.id.clone()),
        });
    }
    None
}

#[derive(Clone, Debug)]
struct PendingRename {
    file_message: MessageId,
    original_name: Option<String>,
}

/// Name prompts waiting for a reply, keyed by the prompt message.
#[derive(Clone, Default)]
pub struct PendingRenames {
    inner: Arc<DashMap<(ChatId, MessageId), PendingRename>>,
}

impl PendingRenames {
    /// Registers a prompt, dropping any earlier unanswered prompt from the same chat.
    /// Returns the prompts that were dropped.
    fn insert(&self, chat: ChatId, prompt: MessageId, pending: PendingRename) -> Vec<MessageId> {
        let mut stale = Vec::new();
        self.inner.retain(|(owner, old_prompt), _| {
            let keep = *owner != chat;
            if !keep {
                stale.push(*old_prompt);
            }
            keep
        });
        self.inner.insert((chat, prompt), pending);
        stale
    }

    fn peek(&self, chat: ChatId, prompt: MessageId) -> Option<PendingRename> {
        self.inner.get(&(chat, prompt)).map(|entry| entry.clone())
    }

    fn take(&self, chat: ChatId, prompt: MessageId) -> Option<PendingRename> {
        self.inner.remove(&(chat, prompt)).map(|(_, pending)| pending)
    }
}

#[derive(Clone, Debug)]
pub struct NameReply {
    prompt: MessageId,
    new_name: String,
}

pub fn is_renamable_upload(msg: Message) -> bool {
    msg.chat.is_private() && media_of(&msg).is_some()
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn ask_new_name(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(media) = media_of(&msg) else {
        return Ok(());
    };
    let old_name = media.file_name.clone().unwrap_or_else(|| "unknown".to_string());
    let prompt = bot
        .send_message(
            msg.chat.id,
            format!(
                "<b>Please enter the new file name...</b>\n\nOld file name: <code>{}</code>",
                html::escape(&old_name)
            ),
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .reply_markup(ForceReply::new())
        .await?;
    let stale = services.renames.insert(
        msg.chat.id,
        prompt.id,
        PendingRename {
            file_message: msg.id,
            original_name: media.file_name,
        },
    );
    for old_prompt in stale {
        if let Err(err) = bot.delete_message(msg.chat.id, old_prompt).await {
            debug!(event = "rename_stale_prompt_delete_failed", error = %err);
        }
    }
    Ok(())
}

pub fn extract_name_reply(msg: Message, services: AppServices) -> Option<NameReply> {
    let prompt = msg.reply_to_message()?.id;
    services.renames.peek(msg.chat.id, prompt)?;
    Some(NameReply {
        prompt,
        new_name: msg.text()?.trim().to_string(),
    })
}

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn handle_name_reply(bot: Bot, services: AppServices, msg: Message, reply: NameReply) -> Result<(), AppError> {
    let Some(pending) = services.renames.take(msg.chat.id, reply.prompt) else {
        return Ok(());
    };
    for message_id in [reply.prompt, msg.id] {
        if let Err(err) = bot.delete_message(msg.chat.id, message_id).await {
            warn!(event = "rename_prompt_delete_failed", error = %err);
        }
    }

    let Some(name) = finalize_file_name(&reply.new_name, pending.original_name.as_deref()) else {
        bot.send_message(msg.chat.id, "❌ Invalid file name.")
            .reply_to_message_id(pending.file_message)
            .await?;
        return Ok(());
    };
    bot.send_message(
        msg.chat.id,
        format!(
            "<b>Select the output file type</b>\n<b>File Name</b> :- <code>{}</code>",
            html::escape(&name)
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_to_message_id(pending.file_message)
    .reply_markup(file_type_keyboard())
    .await?;
    Ok(())
}

/// Strips path separators; appends the old extension when the new name has none.
pub fn finalize_file_name(input: &str, original: Option<&str>) -> Option<String> {
    let cleaned: String = input
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') || c.is_control() { '_' } else { c })
        .collect();
    let name = cleaned.trim().trim_start_matches('.').to_string();
    if name.is_empty() {
        return None;
    }
    if name.contains('.') {
        return Some(name);
    }
    let ext = original
        .and_then(|o| Path::new(o).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty());
    Some(match ext {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    })
}

/// Reads the name back out of the `File Name :- <name>` button message.
pub fn parse_file_name(text: &str) -> Option<String> {
    let (_, name) = text.split_once(":-")?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn file_type_keyboard() -> InlineKeyboardMarkup {
    let button = |label: &str, action: RenameCallback| InlineKeyboardButton::callback(label.to_string(), action.to_payload());
    InlineKeyboardMarkup::new(vec![
        vec![button("📁 Document", RenameCallback::Upload(UploadKind::Document))],
        vec![
            button("🎥 Video", RenameCallback::Upload(UploadKind::Video)),
            button("🎵 Audio", RenameCallback::Upload(UploadKind::Audio)),
        ],
        vec![button("✖️ Cancel", RenameCallback::Cancel)],
    ])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameCallback {
    Upload(UploadKind),
    Cancel,
}

impl RenameCallback {
    pub fn to_payload(self) -> String {
        match self {
            Self::Upload(kind) => format!("{UPLOAD_CALLBACK_PREFIX}{}", kind.as_str()),
            Self::Cancel => CANCEL_CALLBACK.to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if data == CANCEL_CALLBACK {
            return Some(Self::Cancel);
        }
        data.strip_prefix(UPLOAD_CALLBACK_PREFIX)
            .and_then(UploadKind::parse)
            .map(Self::Upload)
    }
}

#[instrument(skip_all, fields(user = %q.from.id, action = ?action))]
pub async fn handle_callback(bot: Bot, services: AppServices, q: CallbackQuery, action: RenameCallback) -> Result<(), AppError> {
    let Some(message) = q.message.clone() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let kind = match action {
        RenameCallback::Cancel => {
            bot.answer_callback_query(q.id).await?;
            bot.delete_message(message.chat.id, message.id).await?;
            return Ok(());
        }
        RenameCallback::Upload(kind) => kind,
    };

    let Some(file_message) = message.reply_to_message() else {
        bot.answer_callback_query(q.id)
            .text("❌ Missing original message!")
            .show_alert(true)
            .await?;
        return Ok(());
    };
    let Some(new_name) = message.text().and_then(parse_file_name) else {
        bot.answer_callback_query(q.id)
            .text("❌ Invalid file name format!")
            .show_alert(true)
            .await?;
        return Ok(());
    };
    let Some(media) = media_of(file_message) else {
        bot.answer_callback_query(q.id)
            .text("❌ Unsupported media type!")
            .show_alert(true)
            .await?;
        return Ok(());
    };
    bot.answer_callback_query(q.id).await?;

    let job = RenameJob {
        user: q.from.id,
        chat_id: message.chat.id,
        status_id: message.id,
        media,
        new_name,
        kind,
    };
    tokio::spawn(async move { job.run(bot, services).await });
    Ok(())
}

struct RenameJob {
    user: UserId,
    chat_id: ChatId,
    status_id: MessageId,
    media: MediaInfo,
    new_name: String,
    kind: UploadKind,
}

impl RenameJob {
    #[instrument(skip_all, fields(user = %self.user, kind = ?self.kind))]
    async fn run(self, bot: Bot, services: AppServices) {
        let workdir = services
            .config
            .download_dir
            .join(format!("rename_{}_{}", self.user, random_suffix(8)));
        let result = self.rename_and_upload(&bot, &services, &workdir).await;
        if let Err(err) = tokio::fs::remove_dir_all(&workdir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(event = "rename_cleanup_failed", path = %workdir.display(), error = %err);
            }
        }

        match result {
            Ok(()) => {
                info!(event = "rename_uploaded", name = %self.new_name);
                if let Err(err) = bot.delete_message(self.chat_id, self.status_id).await {
                    warn!(event = "rename_status_delete_failed", error = %err);
                }
            }
            Err(err) => {
                warn!(event = "rename_failed", error = %err);
                let _ = report_user_error(&bot, self.chat_id, self.status_id, "❌ Rename failed.", err).await;
            }
        }
    }

    async fn rename_and_upload(&self, bot: &Bot, services: &AppServices, workdir: &Path) -> Result<(), AppError> {
        tokio::fs::create_dir_all(workdir).await?;
        let path = workdir.join(&self.new_name);

        let progress = TransferProgress::new();
        let ticker = StatusUpdates::for_transfer(
            bot.clone(),
            self.chat_id,
            self.status_id,
            "⚠️ Downloading file to my server...".to_string(),
            progress.clone(),
        );
        let downloaded = download_telegram_file(bot, &self.media.file_id, &path, progress).await;
        ticker.finish().await;
        downloaded?;

        let settings = services.settings.get(self.user).await;
        let template = settings.caption.unwrap_or_else(|| DEFAULT_CAPTION.to_string());
        let duration = self
            .media
            .duration
            .map(|secs| format_duration(Duration::from_secs(u64::from(secs))))
            .unwrap_or_else(|| "N/A".to_string());
        let caption = render_caption(&template, &self.new_name, &human_size(self.media.size), &duration)?;

        let thumb = match settings.thumbnail.or_else(|| self.media.thumb_id.clone()) {
            Some(file_id) => fetch_thumbnail(bot, &file_id, &workdir.join("thumb.jpg")).await,
            None => None,
        };

        let outgoing = Outgoing {
            kind: self.kind,
            file: InputFile::file(&path).file_name(self.new_name.clone()),
            caption: Some(caption),
            thumb: thumb.map(InputFile::file),
            duration: self.media.duration,
            title: None,
        };
        upload_with_progress(bot, self.chat_id, self.status_id, &outgoing).await?;
        Ok(())
    }
}

async fn download_telegram_file(
    bot: &Bot,
    file_id: &str,
    path: &Path,
    progress: Arc<TransferProgress>,
) -> Result<u64, AppError> {
    let file = bot.get_file(file_id).await?;
    progress.set_total(Some(u64::from(file.meta.size)));

    let mut dst = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    let mut stream = bot.download_file_stream(&file.path);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        dst.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress.advance(chunk.len() as u64);
    }
    dst.flush().await?;
    Ok(written)
}

async fn fetch_thumbnail(bot: &Bot, file_id: &str, path: &Path) -> Option<PathBuf> {
    let result: Result<(), AppError> = async {
        let file = bot.get_file(file_id).await?;
        let mut dst = tokio::fs::File::create(path).await?;
        bot.download_file(&file.path, &mut dst).await?;
        Ok(())
    }
    .await;
    match result {
        Ok(()) => Some(path.to_path_buf()),
        Err(err) => {
            warn!(event = "rename_thumbnail_failed", error = %err);
            None
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("static regex must compile"))
}

/// Fills `{filename}`, `{filesize}` and `{duration}`; any other placeholder is an error.
pub fn render_caption(template: &str, filename: &str, filesize: &str, duration: &str) -> Result<String, AppError> {
    let pattern = placeholder_pattern();
    if let Some(unknown) = pattern
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|name| !matches!(name.as_str(), "filename" | "filesize" | "duration"))
    {
        return Err(AppError::Caption(format!("unknown placeholder {{{unknown}}}")));
    }
    Ok(pattern
        .replace_all(template, |caps: &regex::Captures| match &caps[1] {
            "filename" => html::escape(filename),
            "filesize" => html::escape(filesize),
            _ => html::escape(duration),
        })
        .into_owned())
}

/// Largest size that fits Telegram's 320px thumbnail box, else the smallest one.
pub fn pick_thumbnail(sizes: &[(u32, u32)]) -> Option<usize> {
    let fitting = sizes
        .iter()
        .enumerate()
        .filter(|(_, (w, h))| *w <= THUMB_MAX_SIDE && *h <= THUMB_MAX_SIDE)
        .max_by_key(|(_, (w, h))| u64::from(*w) * u64::from(*h))
        .map(|(i, _)| i);
    fitting.or_else(|| {
        sizes
            .iter()
            .enumerate()
            .min_by_key(|(_, (w, h))| u64::from(*w) * u64::from(*h))
            .map(|(i, _)| i)
    })
}

fn thumbnail_from(photo: &[PhotoSize]) -> Option<String> {
    let dims: Vec<(u32, u32)> = photo.iter().map(|p| (p.width, p.height)).collect();
    pick_thumbnail(&dims).map(|i| photo[i].file.id.clone())
}

pub async fn set_caption(bot: Bot, services: AppServices, msg: Message, template: String) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let template = template.trim();
    if template.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Give me a caption to set.\n\nExample: <code>/set_caption 📕 {filename}\n💾 {filesize}\n⏰ {duration}</code>",
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
        return Ok(());
    }
    if let Err(err) = render_caption(template, "file.pdf", "1.0 MB", "00:01") {
        bot.send_message(msg.chat.id, format!("❌ {err}"))
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }
    services.settings.set_caption(user.id, Some(template.to_string())).await?;
    bot.send_message(msg.chat.id, "✅ Caption saved.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

pub async fn see_caption(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let text = match services.settings.get(user.id).await.caption {
        Some(caption) => format!("<b>Your caption:</b>\n\n<code>{}</code>", html::escape(&caption)),
        None => "You don't have a custom caption.".to_string(),
    };
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

pub async fn del_caption(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    services.settings.set_caption(user.id, None).await?;
    bot.send_message(msg.chat.id, "🗑 Caption deleted.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

pub async fn set_thumb(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(file_id) = msg
        .reply_to_message()
        .and_then(|replied| replied.photo())
        .and_then(thumbnail_from)
    else {
        bot.send_message(msg.chat.id, "Reply to a photo with /set_thumb to save it as your thumbnail.")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    };
    services.settings.set_thumbnail(user.id, Some(file_id)).await?;
    bot.send_message(msg.chat.id, "✅ Thumbnail saved.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}

pub async fn view_thumb(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    match services.settings.get(user.id).await.thumbnail {
        Some(file_id) => {
            bot.send_photo(msg.chat.id, InputFile::file_id(file_id))
                .caption("Your thumbnail")
                .reply_to_message_id(msg.id)
                .await?;
        }
        None => {
            bot.send_message(msg.chat.id, "You don't have a custom thumbnail.")
                .reply_to_message_id(msg.id)
                .await?;
        }
    }
    Ok(())
}

pub async fn del_thumb(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    services.settings.set_thumbnail(user.id, None).await?;
    bot.send_message(msg.chat.id, "🗑 Thumbnail deleted.")
        .reply_to_message_id(msg.id)
        .await?;
    Ok(())
}
