mod archive;
mod config;
mod error;
mod fetch;
mod genlink;
mod handlers;
mod keepalive;
mod libgen;
mod library;
mod locks;
mod media;
mod messaging;
mod progress;
mod rename;
mod sessions;
mod store;
mod upload;
mod yt_dlp;

use crate::{config::Config, error::AppError, fetch::BROWSER_USER_AGENT, sessions::SessionCache};
use handlers::{AppServices, build_handler};
use std::time::{Duration, Instant};
use teloxide::{net::default_reqwest_settings, prelude::*};
use tracing::{debug, error, info, instrument, warn, Instrument};
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

const SESSION_SWEEP_EVERY: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    run().await.map_err(|err| {
        error!(event = "bot_fatal", error = %err);
        err
    })
}

#[instrument]
async fn run() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    let config = Config::from_env()?;
    info!(
        event = "config_loaded",
        admins = config.admins.len(),
        mirrors = config.libgen_mirrors.len(),
        store_channels = config.file_store_channels.len()
    );

    let api_client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(300))
        .build()?;
    let bot = Bot::from_env_with_client(api_client);

    let http = reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    if let Some(settings) = config.keepalive.clone() {
        keepalive::spawn(http.clone(), settings);
    }

    let services = AppServices::new(config, http).await?;
    spawn_session_sweeper(services.sessions.clone());

    let mut dispatcher = Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            shutdown_signal().await;
            match shutdown_token.shutdown() {
                Ok(done) => {
                    done.await;
                    info!(event = "dispatcher_drained");
                }
                Err(_) => warn!(event = "dispatcher_not_running"),
            }
        }
        .in_current_span(),
    );

    info!(event = "bot_started");
    dispatcher.dispatch().await;
    info!(event = "bot_stopped");
    Ok(())
}

fn spawn_session_sweeper(sessions: SessionCache) {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_EVERY);
            loop {
                ticker.tick().await;
                let removed = sessions.purge_expired(Instant::now());
                if removed > 0 {
                    debug!(event = "sessions_swept", removed, remaining = sessions.len());
                }
            }
        }
        .in_current_span(),
    );
}

#[cfg(unix)]
async fn shutdown_signal() {
    let (mut term, mut interrupt) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(interrupt)) => (term, interrupt),
        (term, interrupt) => {
            warn!(event = "signal_handlers_unavailable", sigterm = term.is_ok(), sigint = interrupt.is_ok());
            let _ = tokio::signal::ctrl_c().await;
            info!(event = "shutdown_requested", signal = "ctrl_c");
            return;
        }
    };
    let received = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    };
    info!(event = "shutdown_requested", signal = received);
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_requested", signal = "ctrl_c");
}
