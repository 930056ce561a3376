use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Telegram file download error: {0}")]
    TelegramDownload(#[from] teloxide::DownloadError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yt-dlp execution failed: {0}")]
    YtDlp(String),

    #[error("Missing yt-dlp output: {0}")]
    MissingOutput(String),

    #[error("Download failed with exit code: {0}")]
    DownloadFailed(std::process::ExitStatus),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("Mirror responded unexpectedly: {0}")]
    Scrape(String),

    #[error("Mirror stopped sending data for {} seconds", .0.as_secs())]
    Stalled(std::time::Duration),

    #[error("Invalid download link: {0}")]
    InvalidLink(String),

    #[error("Caption template error: {0}")]
    Caption(String),

    #[error("Cookies file problem: {0}")]
    Cookies(String),
}
