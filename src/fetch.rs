use crate::{
    error::AppError,
    progress::{human_size, TransferProgress},
};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time,
};
use tracing::{info, instrument};
use url::Url;

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(15);
/// Longest gap between two body chunks before a transfer is abandoned.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPTED_CONTENT: [&str; 4] = ["pdf", "epub", "djvu", "octet-stream"];

/// Streams book files from mirror download links.
#[derive(Clone)]
pub struct BookFetcher {
    http: reqwest::Client,
    referer: String,
}

impl BookFetcher {
    pub fn new(http: reqwest::Client, referer: impl Into<String>) -> Self {
        Self {
            http,
            referer: referer.into(),
        }
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header(REFERER, format!("{}/", self.referer.trim_end_matches('/')))
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
    }

    /// Confirms the link serves a book without downloading all of it.
    #[instrument(skip(self))]
    pub async fn validate(&self, raw_url: &str) -> Result<Url, AppError> {
        let url = prepare_url(raw_url)?;
        let response = self.request(url.clone()).timeout(VALIDATE_TIMEOUT).send().await?;
        check_response(&response)?;
        let mut body = response.bytes_stream();
        match body.next().await {
            Some(Ok(chunk)) if !chunk.is_empty() => Ok(url),
            Some(Err(err)) => Err(err.into()),
            _ => Err(AppError::InvalidLink("empty response body".into())),
        }
    }

    #[instrument(skip(self, progress))]
    pub async fn download_to(
        &self,
        raw_url: &str,
        path: &Path,
        max_bytes: u64,
        progress: Arc<TransferProgress>,
    ) -> Result<u64, AppError> {
        let url = prepare_url(raw_url)?;
        let response = time::timeout(IDLE_TIMEOUT, self.request(url).send())
            .await
            .map_err(|_| AppError::Stalled(IDLE_TIMEOUT))??;
        check_response(&response)?;
        if let Some(length) = response.content_length().filter(|len| *len > max_bytes) {
            return Err(too_large(length, max_bytes));
        }
        progress.set_total(response.content_length());

        let mut file = tokio::fs::File::create(path).await?;
        let written = write_body(response.bytes_stream(), &mut file, max_bytes, IDLE_TIMEOUT, &progress).await?;
        if written == 0 {
            return Err(AppError::InvalidLink("empty response body".into()));
        }
        info!(event = "book_download_complete", bytes = written, path = %path.display());
        Ok(written)
    }
}

/// Copies `body` into `out`, failing when a chunk takes longer than `idle` or the size passes `max_bytes`.
async fn write_body<S, C, E, W>(
    body: S,
    out: &mut W,
    max_bytes: u64,
    idle: Duration,
    progress: &TransferProgress,
) -> Result<u64, AppError>
where
    S: Stream<Item = Result<C, E>>,
    C: AsRef<[u8]>,
    AppError: From<E>,
    W: AsyncWrite + Unpin,
{
    futures_util::pin_mut!(body);
    let mut written = 0u64;
    loop {
        let next = time::timeout(idle, body.next())
            .await
            .map_err(|_| AppError::Stalled(idle))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(too_large(written, max_bytes));
        }
        out.write_all(chunk).await?;
        progress.advance(chunk.len() as u64);
    }
    out.flush().await?;
    Ok(written)
}

/// Normalises percent-encoding so mirror links with raw spaces or brackets are fetchable.
pub fn prepare_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim()).map_err(|e| AppError::InvalidLink(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::InvalidLink(format!("unsupported scheme {other}"))),
    }
}

fn too_large(size: u64, limit: u64) -> AppError {
    AppError::InvalidLink(format!(
        "file is {} but Telegram accepts at most {}",
        human_size(size),
        human_size(limit)
    ))
}

fn check_response(response: &reqwest::Response) -> Result<(), AppError> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(AppError::InvalidLink(format!("mirror answered {status}")));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_book_content_type(content_type) {
        return Err(AppError::InvalidLink(format!("unexpected content type {content_type:?}")));
    }
    Ok(())
}

pub fn is_book_content_type(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    ACCEPTED_CONTENT.iter().any(|accepted| lowered.contains(accepted))
}
