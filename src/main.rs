#![forbid(unsafe_code)]

use anyhow::Result;
use huddle::auth::{Authenticator, GuestAuthenticator, JwtAuthenticator};
use huddle::config::ServerConfig;
use huddle::media::sfu::{MediaConfig, MediasoupEngine};
use huddle::room::RoomRegistry;
use huddle::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - Starting server");

    let config = ServerConfig::from_env()?;

    let mut media_config = MediaConfig::from_env();
    media_config.audio_level_threshold = config.room.speaker_threshold;
    match &media_config.announced_address {
        Some(ip) => info!("Using ANNOUNCE_IP={}", ip),
        None => info!("No ANNOUNCE_IP set, ICE candidates carry the listen address"),
    }
    let engine = MediasoupEngine::new(media_config).await?;
    info!("Media engine initialized");

    if let Some(ref tc) = config.turn {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }

    let authenticator: Arc<dyn Authenticator> = match &config.jwt_secret {
        Some(secret) => Arc::new(JwtAuthenticator::new(secret.clone())),
        None => Arc::new(GuestAuthenticator),
    };

    let registry = RoomRegistry::new(engine, config.room.clone(), config.turn.clone());
    let signaling_server = SignalingServer::new(registry, authenticator, &config);

    info!("Starting signaling server on port {}", config.port);

    // Run server until Ctrl+C
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
