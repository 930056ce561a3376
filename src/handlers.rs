use crate::{
    archive::Archiver,
    config::Config,
    error::AppError,
    fetch::BookFetcher,
    genlink, library,
    libgen::{BookSearch, LibgenClient},
    locks::UserLocks,
    media, messaging,
    rename::{self, PendingRenames, RenameCallback},
    sessions::{LibraryCallback, SessionCache},
    store::{BatchStore, JsonTitleStore, SettingsStore},
    yt_dlp::{MediaFetcher, MediaKind, YtDlpClient},
};
use rand::{distributions::Alphanumeric, Rng};
use std::{sync::Arc, time::Duration};
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{Me, MessageId, ParseMode, User},
    utils::{command::BotCommands, html},
};
use tokio::time;
use tracing::{info, instrument, warn};

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "start the bot or open a shared link.")]
    Start(String),
    #[command(description = "show this text.")]
    Help,
    #[command(description = "search Library Genesis: /search <title>")]
    Search(String),
    #[command(description = "download a song as mp3: /song <name or link>")]
    Song(String),
    #[command(description = "same as /song.")]
    Mp3(String),
    #[command(description = "download a video: /video <name or link>")]
    Video(String),
    #[command(description = "same as /video.")]
    Mp4(String),
    #[command(description = "send a message to the admins.")]
    Message(String),
    #[command(description = "reply to a file to get a shareable link.")]
    Link,
    #[command(description = "link a range of channel posts: /batch <first link> <last link>")]
    Batch(String),
    #[command(description = "like /batch but the files cannot be forwarded.")]
    Pbatch(String),
    #[command(description = "set the rename caption template.")]
    SetCaption(String),
    #[command(description = "show your caption template.")]
    SeeCaption,
    #[command(description = "delete your caption template.")]
    DelCaption,
    #[command(description = "reply to a photo to use it as thumbnail.")]
    SetThumb,
    #[command(description = "show your thumbnail.")]
    ViewThumb,
    #[command(description = "delete your thumbnail.")]
    DelThumb,
}

#[derive(Clone)]
pub struct AppServices {
    pub config: Arc<Config>,
    pub sessions: SessionCache,
    pub locks: UserLocks,
    pub books: Arc<dyn BookSearch>,
    pub fetcher: BookFetcher,
    pub media: Arc<dyn MediaFetcher>,
    pub archiver: Archiver,
    pub settings: Arc<SettingsStore>,
    pub batches: Arc<BatchStore>,
    pub renames: PendingRenames,
}

impl AppServices {
    pub async fn new(config: Config, http: reqwest::Client) -> Result<Self, AppError> {
        let titles = JsonTitleStore::open(config.data_dir.join("titles.json")).await?;
        let settings = SettingsStore::open(config.data_dir.join("settings.json")).await?;
        let batches = BatchStore::open(config.data_dir.join("batches.json")).await?;
        let referer = config.libgen_mirrors.first().cloned().unwrap_or_default();

        Ok(Self {
            sessions: SessionCache::new(config.session_ttl),
            locks: UserLocks::new(),
            books: Arc::new(LibgenClient::new(http.clone(), config.libgen_mirrors.clone())),
            fetcher: BookFetcher::new(http, referer),
            media: Arc::new(YtDlpClient::from_config(&config)),
            archiver: Archiver::new(Arc::new(titles), config.log_channel, config.archive_channel()),
            settings: Arc::new(settings),
            batches: Arc::new(batches),
            renames: PendingRenames::default(),
            config: Arc::new(config),
        })
    }
}

pub fn build_handler() -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
                .branch(dptree::filter(messaging::is_log_channel_reply).endpoint(messaging::route_admin_reply))
                .branch(dptree::filter_map(rename::extract_name_reply).endpoint(rename::handle_name_reply))
                .branch(dptree::filter(rename::is_renamable_upload).endpoint(rename::ask_new_name)),
        )
        .branch(
            Update::filter_channel_post()
                .filter(messaging::is_log_channel_reply)
                .endpoint(messaging::route_admin_reply),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

#[instrument(skip_all, fields(chat = %msg.chat.id, command = ?cmd))]
async fn handle_command(bot: Bot, services: AppServices, msg: Message, cmd: Command, me: Me) -> Result<(), AppError> {
    match cmd {
        Command::Start(payload) => genlink::handle_start(bot, services, msg, me, payload).await,
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .reply_to_message_id(msg.id)
                .await?;
            Ok(())
        }
        Command::Search(query) => library::handle_search(bot, services, msg, query).await,
        Command::Song(query) | Command::Mp3(query) => {
            media::handle_media(bot, services, msg, me, query, MediaKind::Audio).await
        }
        Command::Video(query) | Command::Mp4(query) => {
            media::handle_media(bot, services, msg, me, query, MediaKind::Video).await
        }
        Command::Message(args) => messaging::handle_message_command(bot, services, msg, args).await,
        Command::Link => genlink::handle_link(bot, services, msg, me).await,
        Command::Batch(args) => genlink::handle_batch(bot, services, msg, me, args, false).await,
        Command::Pbatch(args) => genlink::handle_batch(bot, services, msg, me, args, true).await,
        Command::SetCaption(template) => rename::set_caption(bot, services, msg, template).await,
        Command::SeeCaption => rename::see_caption(bot, services, msg).await,
        Command::DelCaption => rename::del_caption(bot, services, msg).await,
        Command::SetThumb => rename::set_thumb(bot, services, msg).await,
        Command::ViewThumb => rename::view_thumb(bot, services, msg).await,
        Command::DelThumb => rename::del_thumb(bot, services, msg).await,
    }
}

async fn handle_callback(bot: Bot, services: AppServices, q: CallbackQuery, me: Me) -> Result<(), AppError> {
    let data = q.data.clone().unwrap_or_default();
    if let Some(action) = LibraryCallback::parse(&data) {
        return library::handle_callback(bot, services, q, me, action).await;
    }
    if let Some(action) = RenameCallback::parse(&data) {
        return rename::handle_callback(bot, services, q, action).await;
    }
    warn!(event = "unknown_callback", data = %data);
    bot.answer_callback_query(q.id).await?;
    Ok(())
}

/// Warns the user, then deletes `messages` once `delay` has passed.
pub async fn schedule_auto_delete(bot: &Bot, chat_id: ChatId, messages: Vec<MessageId>, delay: Duration) {
    let Some(first) = messages.first().copied() else {
        return;
    };
    let notice = bot
        .send_message(
            chat_id,
            format!(
                "❗️ <b>This file will be deleted in {}.</b>\nForward it to your saved messages to keep it.",
                describe_delay(delay)
            ),
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(first)
        .await;
    let notice = match notice {
        Ok(notice) => Some(notice.id),
        Err(err) => {
            warn!(event = "auto_delete_notice_failed", error = %err);
            None
        }
    };

    let bot = bot.clone();
    tokio::spawn(async move {
        time::sleep(delay).await;
        for message_id in messages {
            if let Err(err) = bot.delete_message(chat_id, message_id).await {
                warn!(event = "auto_delete_failed", chat = %chat_id, message = message_id.0, error = %err);
            }
        }
        if let Some(notice) = notice {
            if let Err(err) = bot.edit_message_text(chat_id, notice, "🗑 File deleted.").await {
                warn!(event = "auto_delete_notice_edit_failed", error = %err);
            }
        }
        info!(event = "auto_delete_done", chat = %chat_id);
    });
}

pub fn describe_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    let unit = |n: u64, word: &str| if n == 1 { format!("1 {word}") } else { format!("{n} {word}s") };
    match (secs / 60, secs % 60) {
        (0, s) => unit(s, "second"),
        (m, 0) => unit(m, "minute"),
        (m, s) => format!("{} {}", unit(m, "minute"), unit(s, "second")),
    }
}

pub fn user_mention(user: &User) -> String {
    format!(
        "<a href=\"tg://user?id={}\">{}</a>",
        user.id,
        html::escape(&user.full_name())
    )
}

/// Keeps letters, digits, spaces, `_` and `-`; everything else becomes `_`.
pub fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' || c == '_' || c == '-' { c } else { '_' })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
