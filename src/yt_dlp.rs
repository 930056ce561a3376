use crate::{config::Config, error::AppError, fetch::BROWSER_USER_AGENT, progress::ProgressState};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, error, info, instrument, trace, Instrument};

const PRINT_TEMPLATE: &str = "after_move:%(.{id,title,duration,uploader,filepath})j";
const ERROR_TAIL_LINES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Clone)]
pub struct FetchRequest {
    pub query: String,
    pub kind: MediaKind,
    pub progress: ProgressState,
    pub workdir: PathBuf,
    /// Appended to the output name so concurrent users never share a file.
    pub tag: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FetchedMedia {
    pub id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub filepath: PathBuf,
}

impl FetchedMedia {
    pub fn duration_secs(&self) -> Option<u32> {
        self.duration.filter(|d| *d > 0.0).map(|d| d.round() as u32)
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, req: FetchRequest) -> Result<FetchedMedia, AppError>;
}

#[derive(Clone, Debug, Default)]
pub struct YtDlpClient {
    cookies: Option<PathBuf>,
    player_client: String,
    force_ipv4: bool,
}

impl YtDlpClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cookies: config.ytdlp_cookies.clone(),
            player_client: config.ytdlp_player_client.clone(),
            force_ipv4: config.ytdlp_force_ipv4,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--user-agent".to_string(),
            BROWSER_USER_AGENT.to_string(),
            "--add-header".to_string(),
            "Accept-Language:en-US,en;q=0.9".to_string(),
        ];
        if !self.player_client.is_empty() {
            args.push("--extractor-args".into());
            args.push(format!("youtube:player_client={}", self.player_client));
        }
        if self.force_ipv4 {
            args.push("--force-ipv4".into());
        }
        if let Some(cookies) = &self.cookies {
            args.push("--cookies".into());
            args.push(cookies.display().to_string());
        }
        args
    }

    pub fn fetch_args(&self, req: &FetchRequest) -> Vec<String> {
        let mut args = self.base_args();
        match req.kind {
            MediaKind::Audio => args.extend(
                [
                    "-f",
                    "bestaudio/best",
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "192K",
                ]
                .map(String::from),
            ),
            MediaKind::Video => args.extend(
                [
                    "-f",
                    "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
                    "--merge-output-format",
                    "mp4",
                ]
                .map(String::from),
            ),
        }
        let template = req.workdir.join(format!("%(id)s_{}.%(ext)s", req.tag));
        args.push("-o".into());
        args.push(template.display().to_string());
        args.push("--print".into());
        args.push(PRINT_TEMPLATE.into());
        args.push(search_target(&req.query));
        args
    }
}

#[async_trait]
impl MediaFetcher for YtDlpClient {
    #[instrument(skip(self, req), fields(query = %req.query, kind = ?req.kind))]
    async fn fetch(&self, req: FetchRequest) -> Result<FetchedMedia, AppError> {
        if let Some(cookies) = &self.cookies {
            validate_cookies(cookies).await?;
        }
        tokio::fs::create_dir_all(&req.workdir).await?;

        info!(event = "yt_dlp_fetch_start");
        let mut child = Command::new("yt-dlp")
            .args(self.fetch_args(&req))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::MissingOutput("stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::MissingOutput("stderr".into()))?;

        let progress = req.progress.clone();
        let stderr_task = tokio::spawn(
            async move {
                let mut tail = Vec::new();
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    trace!(event = "yt_dlp_stderr_line", line = line.as_str());
                    if tail.len() == ERROR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line.clone());
                    progress.push_line(line);
                }
                tail
            }
            .in_current_span(),
        );

        let mut fetched = None;
        let mut reader = BufReader::new(stdout).lines();
        while let Some(line) = reader.next_line().await? {
            match parse_print_line(&line) {
                Some(media) => fetched = Some(media),
                None => req.progress.push_line(line),
            }
        }

        let status = child.wait().await?;
        let tail = stderr_task.await?;

        if !status.success() {
            error!(event = "yt_dlp_fetch_failed", status = %status, stderr = %tail.join("\n"));
            if tail.is_empty() {
                return Err(AppError::DownloadFailed(status));
            }
            return Err(AppError::YtDlp(tail.join("\n")));
        }

        let media = fetched.ok_or_else(|| AppError::MissingOutput("printed media record".into()))?;
        debug!(event = "yt_dlp_fetch_complete", path = %media.filepath.display());
        Ok(media)
    }
}

/// Searches YouTube for plain text, passes links through untouched.
pub fn search_target(query: &str) -> String {
    let query = query.trim();
    if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch1:{query}")
    }
}

pub fn parse_print_line(line: &str) -> Option<FetchedMedia> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Rejects missing cookie files and files that are not in Netscape format.
pub async fn validate_cookies(path: &Path) -> Result<(), AppError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::Cookies(format!(
                "{} not found; export YouTube cookies in Netscape format",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    let first = contents.lines().next().unwrap_or_default();
    if first.starts_with("# HTTP") || first.starts_with("# Netscape HTTP") {
        Ok(())
    } else {
        Err(AppError::Cookies(format!(
            "{} is not a Netscape cookies file (first line must start with '# HTTP')",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request(kind: MediaKind, query: &str) -> FetchRequest {
        FetchRequest {
            query: query.into(),
            kind,
            progress: ProgressState::new(),
            workdir: PathBuf::from("downloads"),
            tag: "42".into(),
        }
    }

    #[test]
    fn plain_queries_become_searches() {
        assert_eq!(search_target(" vaa vaathi song "), "ytsearch1:vaa vaathi song");
        assert_eq!(search_target("https://youtu.be/abc"), "https://youtu.be/abc");
    }

    #[test]
    fn audio_args_extract_mp3_and_end_with_target() {
        let client = YtDlpClient {
            cookies: Some(PathBuf::from("cookies.txt")),
            player_client: "android".into(),
            force_ipv4: true,
        };
        let args = client.fetch_args(&request(MediaKind::Audio, "baby shark"));
        assert_eq!(args.last().map(String::as_str), Some("ytsearch1:baby shark"));
        assert!(args.windows(2).any(|w| w[0] == "--audio-format" && w[1] == "mp3"));
        assert!(args.windows(2).any(|w| w[0] == "--cookies" && w[1] == "cookies.txt"));
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-o" && w[1].ends_with("%(id)s_42.%(ext)s")));
    }

    #[test]
    fn video_args_merge_to_mp4() {
        let client = YtDlpClient::default();
        let args = client.fetch_args(&request(MediaKind::Video, "x"));
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
        assert!(!args.contains(&"--cookies".to_string()));
        assert!(!args.contains(&"--extractor-args".to_string()));
    }

    #[test]
    fn print_line_parses_media_record() {
        let line = r#"{"id": "abc", "title": "Song", "duration": 212.4, "uploader": null, "filepath": "downloads/abc_42.mp3"}"#;
        let media = parse_print_line(line).unwrap();
        assert_eq!(media.id, "abc");
        assert_eq!(media.duration_secs(), Some(212));
        assert_eq!(media.filepath, PathBuf::from("downloads/abc_42.mp3"));
        assert!(parse_print_line("[download]  45.0% of 3.2MiB").is_none());
    }

    #[tokio::test]
    async fn cookies_must_exist_and_be_netscape_format() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(matches!(validate_cookies(&missing).await, Err(AppError::Cookies(_))));

        let bad = dir.path().join("bad.txt");
        std::fs::write(&bad, "youtube.com\tTRUE\n").unwrap();
        assert!(validate_cookies(&bad).await.is_err());

        let good = dir.path().join("good.txt");
        let mut file = std::fs::File::create(&good).unwrap();
        writeln!(file, "# Netscape HTTP Cookie File").unwrap();
        assert!(validate_cookies(&good).await.is_ok());
    }
}
