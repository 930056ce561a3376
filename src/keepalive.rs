use crate::config::KeepAlive;
use std::time::Duration;
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info, warn, Instrument};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Pings `settings.url` forever so free hosting tiers don't put the bot to sleep.
pub fn spawn(http: reqwest::Client, settings: KeepAlive) -> JoinHandle<()> {
    info!(event = "keepalive_started", url = %settings.url, interval_secs = settings.interval.as_secs());
    tokio::spawn(
        async move {
            let mut ticker = time::interval(settings.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ping(&http, &settings.url).await;
            }
        }
        .in_current_span(),
    )
}

async fn ping(http: &reqwest::Client, url: &str) {
    match http.get(url).timeout(PING_TIMEOUT).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::OK => {
            debug!(event = "keepalive_ok", url);
        }
        Ok(response) => warn!(event = "keepalive_bad_status", url, status = %response.status()),
        Err(err) => error!(event = "keepalive_failed", url, error = %err),
    }
}
