use crate::{
    error::AppError,
    progress::{is_message_not_modified, StatusUpdates, PROGRESS_UPDATE_EVERY},
};
use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use teloxide::{
    payloads::{SendAudioSetters, SendDocumentSetters, SendVideoSetters},
    prelude::*,
    types::{InputFile, MessageId, ParseMode},
    RequestError,
};
use tokio::time::{self, Instant};
use tracing::warn;

const UPLOAD_MAX_RETRIES: usize = 3;
const UPLOAD_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const UPLOAD_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    Document,
    Video,
    Audio,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document" => Some(Self::Document),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Everything needed to (re)build one outgoing media request.
#[derive(Clone, Debug)]
pub struct Outgoing {
    pub kind: UploadKind,
    pub file: InputFile,
    pub caption: Option<String>,
    pub thumb: Option<InputFile>,
    pub duration: Option<u32>,
    pub title: Option<String>,
}

impl Outgoing {
    pub fn document(file: InputFile) -> Self {
        Self {
            kind: UploadKind::Document,
            file,
            caption: None,
            thumb: None,
            duration: None,
            title: None,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// Runs `request` again on flood-wait and transient network errors.
pub async fn with_retry<T, F, Fut>(mut request: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = 1;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(delay) = retry_delay(&err, attempt) else {
                    return Err(err);
                };
                if attempt == UPLOAD_MAX_RETRIES {
                    return Err(err);
                }
                warn!(event = "request_retry", attempt, delay_ms = delay.as_millis() as u64, error = %err);
                time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn retry_delay(err: &RequestError, attempt: usize) -> Option<Duration> {
    match err {
        RequestError::RetryAfter(delay) => Some(*delay),
        RequestError::Network(net) if net.is_timeout() || net.is_connect() => {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=500));
            Some(backoff_delay(attempt) + jitter)
        }
        _ => None,
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    let base_ms = UPLOAD_RETRY_BASE_DELAY.as_millis() as u64;
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    let max_ms = UPLOAD_RETRY_MAX_DELAY.as_millis() as u64;
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

pub async fn send_outgoing(bot: &Bot, chat_id: ChatId, outgoing: &Outgoing) -> Result<Message, RequestError> {
    with_retry(|| {
        let outgoing = outgoing.clone();
        async move {
            match outgoing.kind {
                UploadKind::Document => {
                    let mut req = bot.send_document(chat_id, outgoing.file).parse_mode(ParseMode::Html);
                    if let Some(caption) = outgoing.caption {
                        req = req.caption(caption);
                    }
                    if let Some(thumb) = outgoing.thumb {
                        req = req.thumb(thumb);
                    }
                    req.await
                }
                UploadKind::Video => {
                    let mut req = bot
                        .send_video(chat_id, outgoing.file)
                        .parse_mode(ParseMode::Html)
                        .supports_streaming(true);
                    if let Some(caption) = outgoing.caption {
                        req = req.caption(caption);
                    }
                    if let Some(thumb) = outgoing.thumb {
                        req = req.thumb(thumb);
                    }
                    if let Some(duration) = outgoing.duration {
                        req = req.duration(duration);
                    }
                    req.await
                }
                UploadKind::Audio => {
                    let mut req = bot.send_audio(chat_id, outgoing.file).parse_mode(ParseMode::Html);
                    if let Some(caption) = outgoing.caption {
                        req = req.caption(caption);
                    }
                    if let Some(thumb) = outgoing.thumb {
                        req = req.thumb(thumb);
                    }
                    if let Some(duration) = outgoing.duration {
                        req = req.duration(duration);
                    }
                    if let Some(title) = outgoing.title {
                        req = req.title(title);
                    }
                    req.await
                }
            }
        }
    })
    .await
}

/// Sends the file while an elapsed-time ticker edits the status message.
pub async fn upload_with_progress(
    bot: &Bot,
    chat_id: ChatId,
    status_id: MessageId,
    outgoing: &Outgoing,
) -> Result<Message, AppError> {
    let started_at = Instant::now();
    let kind = outgoing.kind.as_str();
    let ticker = StatusUpdates::spawn(bot.clone(), chat_id, status_id, PROGRESS_UPDATE_EVERY, move || {
        Some(format!("Uploading {kind}… {}s elapsed", started_at.elapsed().as_secs()))
    });
    let result = send_outgoing(bot, chat_id, outgoing).await;
    ticker.finish().await;
    Ok(result?)
}

/// Edits a status message, ignoring "not modified" and logging anything else.
pub async fn edit_status(bot: &Bot, chat_id: ChatId, message_id: MessageId, text: impl Into<String>) {
    if let Err(err) = bot.edit_message_text(chat_id, message_id, text).await {
        if !is_message_not_modified(&err) {
            warn!(event = "status_edit_failed", error = %err);
        }
    }
}

pub async fn report_user_error(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    context: &str,
    err: impl Display,
) -> Result<(), AppError> {
    let text = format!("{context}\nError: {err}");
    if bot.edit_message_text(chat_id, message_id, text.clone()).await.is_err() {
        let _ = bot.send_message(chat_id, text).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use teloxide::ApiError;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn api_errors_are_not_retried() {
        let err = RequestError::Api(ApiError::MessageNotModified);
        assert!(retry_delay(&err, 1).is_none());
    }

    #[test]
    fn upload_kind_parses_known_names() {
        for kind in [UploadKind::Document, UploadKind::Video, UploadKind::Audio] {
            assert_eq!(UploadKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(UploadKind::parse("sticker"), None);
    }

    #[tokio::test]
    async fn with_retry_returns_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<u32, RequestError> = with_retry(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_permanent_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), RequestError> = with_retry(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RequestError::Api(ApiError::BotBlocked))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_waits_out_flood_control() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<u32, RequestError> = with_retry(|| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RequestError::RetryAfter(Duration::ZERO))
                } else {
                    Ok(3)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn with_retry_stops_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), RequestError> = with_retry(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RequestError::RetryAfter(Duration::ZERO))
            }
        })
        .await;
        assert!(matches!(result, Err(RequestError::RetryAfter(_))));
        assert_eq!(calls.load(Ordering::SeqCst), UPLOAD_MAX_RETRIES);
    }
}
