#![forbid(unsafe_code)]

use anyhow::Result;
use huddle::config::ServerConfig;
use huddle::metrics::ServerMetrics;
use huddle::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - Starting server");

    let config = ServerConfig::from_env();
    let metrics = ServerMetrics::new();

    let signaling_server = SignalingServer::new(config, metrics);
    let room_manager = signaling_server.room_manager();

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve() => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(
                "Received Ctrl+C, shutting down ({} rooms, {} participants)...",
                room_manager.room_count(),
                room_manager.total_participant_count()
            );
            room_manager.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
