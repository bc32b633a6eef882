mod bridge;
mod core;
mod engine;
mod http;
mod mpv;
mod poller;
mod socket;

use std::sync::Arc;
use std::time::Duration;

use nowplaying_proto::config::Config;
use nowplaying_proto::metadata::MetadataClient;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How often to retry engine setup while it keeps failing.
const ENGINE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File logging
    let data_dir = nowplaying_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("nowplaying.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,nowplaying_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let engine = Arc::new(mpv::MpvEngine::new(&config.engine));
    let metadata = Arc::new(MetadataClient::new(&config.metadata, &config.stream)?);
    info!("Metadata endpoint: {}", metadata.url());

    let coordinator = core::PlaybackCoordinator::new(
        engine,
        metadata,
        core::CoordinatorSettings::from_config(&config),
    );

    // Engine setup keeps retrying in the background; commands are no-ops
    // until it succeeds.
    if !coordinator.initialize().await {
        warn!(
            "Engine not ready, retrying every {:?}",
            ENGINE_RETRY_INTERVAL
        );
        let retry = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ENGINE_RETRY_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if retry.initialize().await {
                    break;
                }
            }
        });
    }

    // Lifecycle changes from clients funnel into the bridge
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel::<bridge::AppLifecycle>(16);
    let bridge = bridge::EngineBridge::attach(coordinator.clone(), lifecycle_rx);

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        coordinator.clone(),
        lifecycle_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            coordinator.clone(),
            lifecycle_tx.clone(),
        );
    }

    info!("Daemon initialised");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    bridge.detach().await;
    coordinator.teardown().await;
    Ok(())
}
