#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod session;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::room::{RoomRegistry, RoomSummary};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionContext;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted inbound frame.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    ctx: ConnectionContext,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(
        registry: RoomRegistry,
        authenticator: Arc<dyn Authenticator>,
        config: &ServerConfig,
    ) -> Self {
        info!("Max connections: {}", config.max_connections);
        Self {
            ctx: ConnectionContext {
                registry,
                authenticator,
                request_timeout: config.request_timeout,
                idle_timeout: config.idle_timeout,
            },
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.ctx.registry
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/api/rooms/{room_id}", get(room_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.registry();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count(),
        "peers": registry.total_peer_count(),
    }))
}

/// Read-only room view from the room's last published snapshot.
async fn room_handler(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSummary>, StatusCode> {
    server
        .registry()
        .summary(&room_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.ctx, permit))
}
