use crate::{
    archive::ArchiveEntry,
    error::AppError,
    handlers::{random_suffix, sanitize_file_stem, schedule_auto_delete, user_mention, AppServices},
    libgen::{Book, MIN_QUERY_CHARS},
    progress::{is_message_not_modified, StatusUpdates, TransferProgress},
    sessions::{search_keyboard, LibraryCallback, PageWindow, SearchSession, SessionKey},
    upload::{edit_status, report_user_error, upload_with_progress, Outgoing},
};
use std::time::Instant;
use teloxide::{
    prelude::*,
    types::{InputFile, Me, MessageId, ParseMode, User},
    utils::html,
};
use tracing::{info, instrument, warn};

const FILE_STEM_CHARS: usize = 40;

#[instrument(skip_all, fields(chat = %msg.chat.id))]
pub async fn handle_search(bot: Bot, services: AppServices, msg: Message, query: String) -> Result<(), AppError> {
    if !msg.chat.is_private() {
        return Ok(());
    }
    let query = query.trim();
    if query.is_empty() {
        bot.send_message(
            msg.chat.id,
            "⚠️ Please provide a search query!\nExample: <code>/search The Great Gatsby</code>",
        )
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(msg.id)
        .await?;
        return Ok(());
    }
    if query.chars().count() < MIN_QUERY_CHARS {
        bot.send_message(msg.chat.id, "❌ Search query too short (min 3 characters)")
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }

    let status = bot
        .send_message(msg.chat.id, "🔍 Searching the library...")
        .reply_to_message_id(msg.id)
        .await?;

    let results = match services.books.search(query).await {
        Ok(results) => results,
        Err(err) => {
            warn!(event = "library_search_failed", query, error = %err);
            edit_status(&bot, msg.chat.id, status.id, "❌ Service unavailable. Please try again later.").await;
            return Ok(());
        }
    };
    if results.is_empty() {
        edit_status(&bot, msg.chat.id, status.id, format!("❌ No results found for \"{query}\"")).await;
        return Ok(());
    }

    let total = results.len();
    let (key, session) = services.sessions.insert(SearchSession::new(query.to_string(), results));
    info!(event = "library_session_created", key = %key, results = total);
    let Some(window) = PageWindow::new(total, 1) else {
        return Ok(());
    };
    bot.edit_message_text(msg.chat.id, status.id, results_text(&session, msg.from()))
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .reply_markup(search_keyboard(&session.results, &key, &window))
        .await?;
    Ok(())
}

pub fn results_text(session: &SearchSession, requester: Option<&User>) -> String {
    let mut text = format!(
        "📚 Found <b>{}</b> results for <b>{}</b>\n",
        session.results.len(),
        html::escape(&session.query)
    );
    if let Some(user) = requester {
        text.push_str(&format!("Requested by: {}\n", user_mention(user)));
    }
    text.push_str("\nTap a result to download it.");
    text
}

#[instrument(skip_all, fields(user = %q.from.id, action = ?action))]
pub async fn handle_callback(
    bot: Bot,
    services: AppServices,
    q: CallbackQuery,
    me: Me,
    action: LibraryCallback,
) -> Result<(), AppError> {
    match action {
        LibraryCallback::Noop => {
            bot.answer_callback_query(q.id).await?;
        }
        LibraryCallback::Page { key, page } => show_page(&bot, &services, q, key, page).await?,
        LibraryCallback::Download { key, index } => {
            let Some(session) = services.sessions.get(&key, Instant::now()) else {
                bot.answer_callback_query(q.id)
                    .text("Session expired! Please search again")
                    .show_alert(true)
                    .await?;
                return Ok(());
            };
            let Some(book) = session.results.get(index).cloned() else {
                bot.answer_callback_query(q.id).text("Invalid selection!").await?;
                return Ok(());
            };
            let Some(message) = q.message.as_ref() else {
                bot.answer_callback_query(q.id).await?;
                return Ok(());
            };
            let (chat_id, reply_to) = (message.chat.id, message.id);

            let notice = if services.locks.is_busy(q.from.id) {
                "⏳ Your previous download is still running, this one is queued."
            } else {
                "📥 Starting download..."
            };
            bot.answer_callback_query(q.id.clone()).text(notice).await?;

            let user = q.from.clone();
            let via = me.user.first_name.clone();
            tokio::spawn(async move {
                run_book_download(bot, services, user, via, chat_id, reply_to, book).await;
            });
        }
    }
    Ok(())
}

async fn show_page(
    bot: &Bot,
    services: &AppServices,
    q: CallbackQuery,
    key: SessionKey,
    page: usize,
) -> Result<(), AppError> {
    let Some(session) = services.sessions.get(&key, Instant::now()) else {
        bot.answer_callback_query(q.id)
            .text("Search session expired!")
            .show_alert(true)
            .await?;
        return Ok(());
    };
    let Some(window) = PageWindow::new(session.results.len(), page) else {
        bot.answer_callback_query(q.id).text("Invalid page!").await?;
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    let edit = bot
        .edit_message_text(message.chat.id, message.id, results_text(&session, Some(&q.from)))
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .reply_markup(search_keyboard(&session.results, &key, &window))
        .await;
    if let Err(err) = edit {
        if !is_message_not_modified(&err) {
            warn!(event = "library_page_edit_failed", error = %err);
        }
    }
    bot.answer_callback_query(q.id).await?;
    Ok(())
}

#[instrument(skip_all, fields(user = %user.id, book = %book.id))]
async fn run_book_download(
    bot: Bot,
    services: AppServices,
    user: User,
    via: String,
    chat_id: ChatId,
    reply_to: MessageId,
    book: Book,
) {
    let _guard = services.locks.acquire(user.id).await;
    let status = match bot
        .send_message(chat_id, "⏳ Verifying file availability...")
        .reply_to_message_id(reply_to)
        .await
    {
        Ok(status) => status,
        Err(err) => {
            warn!(event = "library_status_send_failed", error = %err);
            return;
        }
    };

    if let Err(err) = deliver_book(&bot, &services, &user, &via, chat_id, status.id, &book).await {
        warn!(event = "library_delivery_failed", error = %err);
        let _ = report_user_error(&bot, chat_id, status.id, "❌ Failed to send the book.", describe_send_error(&err)).await;
    }
}

async fn deliver_book(
    bot: &Bot,
    services: &AppServices,
    user: &User,
    via: &str,
    chat_id: ChatId,
    status_id: MessageId,
    book: &Book,
) -> Result<(), AppError> {
    let Some(link) = services.books.resolve_download(book).await? else {
        edit_status(bot, chat_id, status_id, "❌ No direct download available for this book.").await;
        return Ok(());
    };
    let file_name = book_file_name(book);
    let caption = book_caption(book);

    let sent = if services.config.libgen_send_by_url {
        let url = services.fetcher.validate(&link).await?;
        edit_status(bot, chat_id, status_id, "📤 Sending file...").await;
        let outgoing = Outgoing::document(InputFile::url(url).file_name(file_name)).caption(caption);
        upload_with_progress(bot, chat_id, status_id, &outgoing).await?
    } else {
        tokio::fs::create_dir_all(&services.config.download_dir).await?;
        let path = services
            .config
            .download_dir
            .join(format!("book_{}_{}.{}", book.id, random_suffix(8), book_extension(book)));

        let progress = TransferProgress::new();
        let ticker = StatusUpdates::for_transfer(
            bot.clone(),
            chat_id,
            status_id,
            format!("📥 Downloading {}", book.title),
            progress.clone(),
        );
        let downloaded = services
            .fetcher
            .download_to(&link, &path, services.config.upload_limit, progress)
            .await;
        ticker.finish().await;

        let result = match downloaded {
            Ok(_) => {
                let outgoing = Outgoing::document(InputFile::file(&path).file_name(file_name)).caption(caption);
                upload_with_progress(bot, chat_id, status_id, &outgoing).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(event = "library_cleanup_failed", path = %path.display(), error = %err);
            }
        }
        result?
    };
    info!(event = "library_book_sent", title = %book.title);

    if let Some(delay) = services.config.auto_delete {
        schedule_auto_delete(bot, chat_id, vec![sent.id], delay).await;
    }
    if let Some(document) = sent.document() {
        let entry = ArchiveEntry {
            title: book.title.clone(),
            file_id: document.file.id.clone(),
            log_caption: log_caption(book, user, via),
        };
        let outcome = services.archiver.archive(bot, &entry).await;
        info!(event = "library_archive_outcome", outcome = ?outcome);
    }
    if let Err(err) = bot.delete_message(chat_id, status_id).await {
        warn!(event = "library_status_delete_failed", error = %err);
    }
    Ok(())
}

fn book_extension(book: &Book) -> String {
    let ext = book.extension.trim().to_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        "pdf".to_string()
    } else {
        ext
    }
}

pub fn book_file_name(book: &Book) -> String {
    let stem: String = book.title.chars().take(FILE_STEM_CHARS).collect();
    let stem = sanitize_file_stem(&stem);
    let stem = if stem.is_empty() { format!("book_{}", book.id) } else { stem };
    format!("{stem}.{}", book_extension(book))
}

pub fn book_caption(book: &Book) -> String {
    format!(
        "📚 <b>{}</b>\n👤 <b>Author:</b> {}\n📦 <b>Size:</b> {}",
        html::escape(&book.title),
        html::escape(or_unknown(&book.author)),
        html::escape(or_unknown(&book.size)),
    )
}

fn log_caption(book: &Book, user: &User, via: &str) -> String {
    format!(
        "{}\n\n📥 Requested by: {}\n🆔 User ID: <code>{}</code>\n🤖 Via: {}",
        book_caption(book),
        user_mention(user),
        user.id,
        html::escape(via)
    )
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "Unknown"
    } else {
        value
    }
}

/// Translates the Bot API errors users actually hit into something readable.
pub fn describe_send_error(err: &AppError) -> String {
    let raw = err.to_string();
    if raw.contains("WEBPAGE_CURL_FAILED") {
        "The mirror refused Telegram's download. Try again later.".to_string()
    } else if raw.contains("WEBPAGE_MEDIA_EMPTY") {
        "Telegram could not read this file format.".to_string()
    } else {
        raw
    }
}
