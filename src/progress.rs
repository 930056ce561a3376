use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use teloxide::{
    prelude::*,
    types::MessageId,
    ApiError, RequestError,
};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::warn;

const PROGRESS_LINES: usize = 6;
const MAX_STATUS_CHARS: usize = 3800;
const MIB: u64 = 1024 * 1024;
const LARGE_FILE_BYTES: u64 = 100 * MIB;
const BAR_WIDTH: usize = 20;

pub const PROGRESS_UPDATE_EVERY: Duration = Duration::from_secs(2);

/// Decides when a transfer is worth another status edit.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<(Instant, u64)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, done: u64, total: Option<u64>, now: Instant) -> bool {
        let complete = total.is_some_and(|t| t > 0 && done >= t);
        let emit = match self.last_emit {
            None => true,
            Some((_, last_done)) if complete => done != last_done,
            Some((at, last_done)) => {
                now.saturating_duration_since(at) >= self.interval
                    && done.saturating_sub(last_done) >= step_bytes(total)
            }
        };
        if emit {
            self.last_emit = Some((now, done));
        }
        emit
    }
}

/// Minimum advance between edits: 1% for ordinary files, whole megabytes for large ones.
pub fn step_bytes(total: Option<u64>) -> u64 {
    match total {
        None | Some(0) => MIB,
        Some(total) if total < LARGE_FILE_BYTES => (total / 100).max(1),
        Some(total) => ((total / 100) / MIB).max(1) * MIB,
    }
}

/// Byte counters shared between a transfer loop and its status ticker.
#[derive(Debug, Default)]
pub struct TransferProgress {
    done: AtomicU64,
    total: AtomicU64,
}

impl TransferProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn advance(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, Option<u64>) {
        let total = self.total.load(Ordering::Relaxed);
        (
            self.done.load(Ordering::Relaxed),
            (total > 0).then_some(total),
        )
    }
}

pub fn render_transfer(label: &str, done: u64, total: Option<u64>, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(0.001);
    let speed = (done as f64 / secs) as u64;
    let mut text = format!("{label}\n\n");
    match total {
        Some(total) if total > 0 => {
            let ratio = (done as f64 / total as f64).clamp(0.0, 1.0);
            let filled = (ratio * BAR_WIDTH as f64).round() as usize;
            text.push_str(&format!(
                "[{}{}] {:.1}%\n",
                "●".repeat(filled),
                "○".repeat(BAR_WIDTH - filled),
                ratio * 100.0
            ));
            text.push_str(&format!("{} of {}\n", human_size(done), human_size(total)));
            let remaining = total.saturating_sub(done);
            if speed > 0 {
                text.push_str(&format!(
                    "Speed: {}/s\nETA: {}",
                    human_size(speed),
                    format_duration(Duration::from_secs(remaining / speed))
                ));
            } else {
                text.push_str("Speed: -\nETA: -");
            }
        }
        _ => {
            text.push_str(&format!("{} done\nSpeed: {}/s", human_size(done), human_size(speed)));
        }
    }
    text
}

/// Rolling tail of yt-dlp output lines.
#[derive(Clone)]
pub struct ProgressState {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(PROGRESS_LINES))),
        }
    }

    pub fn push_line(&self, line: String) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() == PROGRESS_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn build_text(&self, heading: &str) -> String {
        let mut text = format!("{heading}\n");
        let Ok(lines) = self.lines.lock() else {
            return text;
        };
        for line in lines.iter() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if text.len() + trimmed.len() + 1 > MAX_STATUS_CHARS {
                break;
            }
            text.push_str(trimmed);
            text.push('\n');
        }
        text
    }
}

/// Ticker that keeps a status message in sync with a long-running job.
pub struct StatusUpdates {
    done_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusUpdates {
    /// `render` is polled on every tick; `None` skips the tick.
    pub fn spawn<F>(bot: Bot, chat_id: ChatId, message_id: MessageId, every: Duration, mut render: F) -> Self
    where
        F: FnMut() -> Option<String> + Send + 'static,
    {
        let (done_tx, mut done_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            let mut last_text: Option<String> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(text) = render() else {
                            continue;
                        };
                        if last_text.as_deref() == Some(text.as_str()) {
                            continue;
                        }
                        match bot.edit_message_text(chat_id, message_id, text.clone()).await {
                            Ok(_) => last_text = Some(text),
                            Err(err) if is_message_not_modified(&err) => last_text = Some(text),
                            Err(err) => warn!(event = "status_edit_failed", error = %err),
                        }
                    }
                    _ = done_rx.changed() => {
                        break;
                    }
                }
            }
        });
        Self { done_tx, task }
    }

    /// Ticker driven by transfer counters and a throttle.
    pub fn for_transfer(
        bot: Bot,
        chat_id: ChatId,
        message_id: MessageId,
        label: String,
        progress: Arc<TransferProgress>,
    ) -> Self {
        let started = Instant::now();
        let mut throttle = ProgressThrottle::new(PROGRESS_UPDATE_EVERY);
        Self::spawn(bot, chat_id, message_id, Duration::from_secs(1), move || {
            let (done, total) = progress.snapshot();
            let now = Instant::now();
            throttle
                .should_emit(done, total, now)
                .then(|| render_transfer(&label, done, total, now.duration_since(started)))
        })
    }

    pub async fn finish(self) {
        let _ = self.done_tx.send(true);
        let _ = self.task.await;
    }
}

pub fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_scales_with_file_size() {
        assert_eq!(step_bytes(None), MIB);
        assert_eq!(step_bytes(Some(50)), 1);
        assert_eq!(step_bytes(Some(10 * MIB)), 10 * MIB / 100);
        assert_eq!(step_bytes(Some(150 * MIB)), MIB);
        assert_eq!(step_bytes(Some(1024 * MIB)), 10 * MIB);
    }

    #[test]
    fn throttle_never_emits_twice_within_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(2));
        let start = Instant::now();
        let total = Some(1000);
        assert!(throttle.should_emit(0, total, start));
        assert!(!throttle.should_emit(500, total, start + Duration::from_millis(1500)));
        assert!(throttle.should_emit(500, total, start + Duration::from_secs(2)));
        assert!(!throttle.should_emit(505, total, start + Duration::from_secs(3)));
        assert!(!throttle.should_emit(509, total, start + Duration::from_secs(10)));
        assert!(throttle.should_emit(510, total, start + Duration::from_secs(10)));
    }

    #[test]
    fn throttle_always_emits_completion_once() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(2));
        let start = Instant::now();
        assert!(throttle.should_emit(10, Some(1000), start));
        assert!(throttle.should_emit(1000, Some(1000), start + Duration::from_millis(10)));
        assert!(!throttle.should_emit(1000, Some(1000), start + Duration::from_secs(5)));
    }

    #[test]
    fn transfer_counters_report_unknown_total_as_none() {
        let progress = TransferProgress::new();
        progress.advance(10);
        progress.advance(5);
        assert_eq!(progress.snapshot(), (15, None));
        progress.set_total(Some(100));
        assert_eq!(progress.snapshot(), (15, Some(100)));
    }

    #[test]
    fn render_includes_percentage_and_sizes() {
        let text = render_transfer("Downloading", 512 * 1024, Some(1024 * 1024), Duration::from_secs(1));
        assert!(text.starts_with("Downloading\n"));
        assert!(text.contains("50.0%"));
        assert!(text.contains("512.0 KB of 1.0 MB"));
        assert!(text.contains("ETA: 00:01"));

        let unknown = render_transfer("Downloading", 2048, None, Duration::from_secs(2));
        assert!(unknown.contains("2.0 KB done"));
    }

    #[test]
    fn progress_state_keeps_tail() {
        let state = ProgressState::new();
        for i in 0..10 {
            state.push_line(format!("line {i}"));
        }
        let text = state.build_text("Downloading…");
        assert!(text.starts_with("Downloading…\n"));
        assert!(!text.contains("line 3"));
        assert!(text.contains("line 4"));
        assert!(text.contains("line 9"));
    }

    #[test]
    fn sizes_and_durations_are_humanized() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(5 * 1024 * 1024 * 1024), "5.00 GB");
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
