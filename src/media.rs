use crate::{
    error::AppError,
    handlers::AppServices,
    progress::{ProgressState, StatusUpdates, PROGRESS_UPDATE_EVERY},
    upload::{report_user_error, upload_with_progress, Outgoing, UploadKind},
    yt_dlp::{FetchRequest, FetchedMedia, MediaKind},
};
use teloxide::{
    prelude::*,
    types::{InputFile, Me, ParseMode},
    utils::html,
};
use tracing::{info, instrument, warn};

const COOKIES_HINT: &str = "If this keeps happening, the YouTube cookies probably expired. Ask an admin to refresh cookies.txt.";

#[instrument(skip_all, fields(chat = %msg.chat.id, kind = ?kind))]
pub async fn handle_media(
    bot: Bot,
    services: AppServices,
    msg: Message,
    me: Me,
    query: String,
    kind: MediaKind,
) -> Result<(), AppError> {
    if kind == MediaKind::Audio && !msg.chat.is_private() {
        return Ok(());
    }
    let query = query.trim();
    if query.is_empty() {
        let example = match kind {
            MediaKind::Audio => "❌ Example: <code>/song vaa vaathi song</code>",
            MediaKind::Video => "❌ Example: <code>/video Baby Shark Dance</code>",
        };
        bot.send_message(msg.chat.id, example)
            .parse_mode(ParseMode::Html)
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }

    let chat_id = msg.chat.id;
    let status = bot
        .send_message(chat_id, format!("🔍 Searching...\n{query}"))
        .reply_to_message_id(msg.id)
        .await?;

    let progress = ProgressState::new();
    let ticker = {
        let progress = progress.clone();
        StatusUpdates::spawn(bot.clone(), chat_id, status.id, PROGRESS_UPDATE_EVERY, move || {
            Some(progress.build_text("⬇️ Downloading..."))
        })
    };
    let tag = msg
        .from()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| chat_id.to_string());
    let fetched = services
        .media
        .fetch(FetchRequest {
            query: query.to_string(),
            kind,
            progress,
            workdir: services.config.download_dir.clone(),
            tag,
        })
        .await;
    ticker.finish().await;

    let media = match fetched {
        Ok(media) => media,
        Err(err) => {
            warn!(event = "media_fetch_failed", error = %err);
            report_user_error(&bot, chat_id, status.id, "❌ Download failed.", format!("{err}\n\n{COOKIES_HINT}")).await?;
            return Ok(());
        }
    };

    let outgoing = outgoing_for(&media, kind, me.username());
    let sent = upload_with_progress(&bot, chat_id, status.id, &outgoing).await;
    if let Err(err) = tokio::fs::remove_file(&media.filepath).await {
        warn!(event = "media_cleanup_failed", path = %media.filepath.display(), error = %err);
    }

    match sent {
        Ok(_) => {
            info!(event = "media_sent", id = %media.id);
            if let Err(err) = bot.delete_message(chat_id, status.id).await {
                warn!(event = "media_status_delete_failed", error = %err);
            }
        }
        Err(err) => {
            report_user_error(&bot, chat_id, status.id, "❌ Upload failed.", err).await?;
        }
    }
    Ok(())
}

pub fn outgoing_for(media: &FetchedMedia, kind: MediaKind, bot_username: &str) -> Outgoing {
    let title = media.title.clone().unwrap_or_else(|| media.id.clone());
    let icon = match kind {
        MediaKind::Audio => "🎵",
        MediaKind::Video => "🎬",
    };
    let mut caption = format!("{icon} <b>{}</b>", html::escape(&title));
    if let Some(uploader) = &media.uploader {
        caption.push_str(&format!("\n👤 {}", html::escape(uploader)));
    }
    caption.push_str(&format!("\nvia @{bot_username}"));

    Outgoing {
        kind: match kind {
            MediaKind::Audio => UploadKind::Audio,
            MediaKind::Video => UploadKind::Video,
        },
        file: InputFile::file(&media.filepath),
        caption: Some(caption),
        thumb: None,
        duration: media.duration_secs(),
        title: (kind == MediaKind::Audio).then_some(title),
    }
}
