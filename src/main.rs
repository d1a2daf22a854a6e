#![forbid(unsafe_code)]

use anyhow::Result;
use roomcast::media::{MediaConfig, MediaWorker};
use roomcast::metrics::ServerMetrics;
use roomcast::room::RoomManager;
use roomcast::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomcast - starting server");

    let mut media_config = MediaConfig::default();

    // ICE candidates must carry a reachable address; default to loopback for
    // local testing.
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("Using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
        media_config.transport = media_config.transport.with_announced_ip(addr);
    } else {
        info!(
            "No ANNOUNCE_IP set, using {}",
            media_config.transport.announced_ip
        );
    }

    if let Some(min) = env_port("RTC_MIN_PORT") {
        media_config.worker.rtc_min_port = min;
    }
    if let Some(max) = env_port("RTC_MAX_PORT") {
        media_config.worker.rtc_max_port = max;
    }

    let media = Arc::new(MediaWorker::new(media_config).await?);
    let metrics = ServerMetrics::new();
    let rooms = Arc::new(RoomManager::new(media, metrics.clone()));

    info!("Media worker and room manager initialized");

    let server = SignalingServer::new(rooms.clone(), metrics);
    let port = env_port("PORT").unwrap_or(4001);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            rooms.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
