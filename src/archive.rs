use crate::{error::AppError, upload::with_retry};
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::{
    payloads::SendDocumentSetters,
    prelude::*,
    types::{InputFile, ParseMode},
};
use tracing::{info, warn};

/// Title key used for duplicate suppression; `None` when the title cannot identify a book.
pub fn normalize_title(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() || normalized == "unknown" {
        None
    } else {
        Some(normalized)
    }
}

#[async_trait]
pub trait TitleStore: Send + Sync {
    /// Records `title`; `false` when it was already present.
    async fn claim(&self, title: &str) -> Result<bool, AppError>;

    async fn release(&self, title: &str) -> Result<(), AppError>;
}

/// Somewhere an already-uploaded Telegram file can be copied to.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn send_file(&self, channel: ChatId, file_id: &str, caption: Option<String>) -> Result<(), AppError>;
}

#[async_trait]
impl ArchiveSink for Bot {
    async fn send_file(&self, channel: ChatId, file_id: &str, caption: Option<String>) -> Result<(), AppError> {
        with_retry(|| {
            let mut req = self
                .send_document(channel, InputFile::file_id(file_id))
                .parse_mode(ParseMode::Html);
            if let Some(caption) = caption.clone() {
                req = req.caption(caption);
            }
            async move { req.await }
        })
        .await?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub title: String,
    pub file_id: String,
    pub log_caption: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Stored,
    Duplicate,
    Skipped,
    Failed,
}

#[derive(Clone)]
pub struct Archiver {
    titles: Arc<dyn TitleStore>,
    log_channel: ChatId,
    store_channel: Option<ChatId>,
}

impl Archiver {
    pub fn new(titles: Arc<dyn TitleStore>, log_channel: ChatId, store_channel: Option<ChatId>) -> Self {
        Self {
            titles,
            log_channel,
            store_channel,
        }
    }

    /// Mirrors the file to the log channel, then stores it once per normalised title.
    pub async fn archive(&self, sink: &dyn ArchiveSink, entry: &ArchiveEntry) -> ArchiveOutcome {
        if let Err(err) = sink
            .send_file(self.log_channel, &entry.file_id, Some(entry.log_caption.clone()))
            .await
        {
            warn!(event = "archive_log_send_failed", error = %err);
        }

        let Some(channel) = self.store_channel else {
            return ArchiveOutcome::Skipped;
        };
        let Some(title) = normalize_title(&entry.title) else {
            return ArchiveOutcome::Skipped;
        };

        match self.titles.claim(&title).await {
            Ok(false) => {
                info!(event = "archive_duplicate", title = %title);
                ArchiveOutcome::Duplicate
            }
            Ok(true) => match sink.send_file(channel, &entry.file_id, None).await {
                Ok(()) => {
                    info!(event = "archive_stored", title = %title);
                    ArchiveOutcome::Stored
                }
                Err(err) => {
                    warn!(event = "archive_store_send_failed", title = %title, error = %err);
                    if let Err(err) = self.titles.release(&title).await {
                        warn!(event = "archive_release_failed", title = %title, error = %err);
                    }
                    ArchiveOutcome::Failed
                }
            },
            Err(err) => {
                warn!(event = "archive_title_check_failed", title = %title, error = %err);
                ArchiveOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
    };
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryTitles(Mutex<HashSet<String>>);

    #[async_trait]
    impl TitleStore for MemoryTitles {
        async fn claim(&self, title: &str) -> Result<bool, AppError> {
            Ok(self.0.lock().await.insert(title.to_string()))
        }

        async fn release(&self, title: &str) -> Result<(), AppError> {
            self.0.lock().await.remove(title);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ChatId, String)>>,
        fail_store: AtomicBool,
    }

    #[async_trait]
    impl ArchiveSink for RecordingSink {
        async fn send_file(&self, channel: ChatId, file_id: &str, _caption: Option<String>) -> Result<(), AppError> {
            if channel == STORE && self.fail_store.load(Ordering::SeqCst) {
                return Err(AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, "store unavailable")));
            }
            self.sent.lock().await.push((channel, file_id.to_string()));
            Ok(())
        }
    }

    const LOG: ChatId = ChatId(-1001);
    const STORE: ChatId = ChatId(-1002);

    fn entry(title: &str) -> ArchiveEntry {
        ArchiveEntry {
            title: title.into(),
            file_id: format!("file-{title}"),
            log_caption: "caption".into(),
        }
    }

    async fn sends_to(sink: &RecordingSink, channel: ChatId) -> usize {
        sink.sent.lock().await.iter().filter(|(c, _)| *c == channel).count()
    }

    #[test]
    fn titles_are_trimmed_and_lowercased() {
        assert_eq!(normalize_title("  Dune Messiah "), Some("dune messiah".into()));
        assert_eq!(normalize_title("   "), None);
        assert_eq!(normalize_title("Unknown"), None);
    }

    #[tokio::test]
    async fn same_normalised_title_is_stored_once() {
        let archiver = Archiver::new(Arc::new(MemoryTitles::default()), LOG, Some(STORE));
        let sink = RecordingSink::default();

        assert_eq!(archiver.archive(&sink, &entry("Dune")).await, ArchiveOutcome::Stored);
        assert_eq!(archiver.archive(&sink, &entry(" dune ")).await, ArchiveOutcome::Duplicate);

        assert_eq!(sends_to(&sink, STORE).await, 1);
        assert_eq!(sends_to(&sink, LOG).await, 2);
    }

    #[tokio::test]
    async fn concurrent_archives_of_one_title_store_once() {
        let archiver = Archiver::new(Arc::new(MemoryTitles::default()), LOG, Some(STORE));
        let sink = Arc::new(RecordingSink::default());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let archiver = archiver.clone();
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                archiver.archive(sink.as_ref(), &entry("Neuromancer")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(sends_to(&sink, STORE).await, 1);
    }

    #[tokio::test]
    async fn failed_store_send_releases_title() {
        let archiver = Archiver::new(Arc::new(MemoryTitles::default()), LOG, Some(STORE));
        let sink = RecordingSink::default();
        sink.fail_store.store(true, Ordering::SeqCst);
        assert_eq!(archiver.archive(&sink, &entry("Snow Crash")).await, ArchiveOutcome::Failed);

        sink.fail_store.store(false, Ordering::SeqCst);
        assert_eq!(archiver.archive(&sink, &entry("Snow Crash")).await, ArchiveOutcome::Stored);
    }

    #[tokio::test]
    async fn unknown_titles_and_missing_store_channel_skip_storage() {
        let archiver = Archiver::new(Arc::new(MemoryTitles::default()), LOG, Some(STORE));
        let sink = RecordingSink::default();
        assert_eq!(archiver.archive(&sink, &entry("unknown")).await, ArchiveOutcome::Skipped);

        let no_store = Archiver::new(Arc::new(MemoryTitles::default()), LOG, None);
        assert_eq!(no_store.archive(&sink, &entry("Dune")).await, ArchiveOutcome::Skipped);
        assert_eq!(sends_to(&sink, STORE).await, 0);
        assert_eq!(sends_to(&sink, LOG).await, 2);
    }
}
