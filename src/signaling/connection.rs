#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{Inbound, Rejected, Response};
use super::session::Session;
use crate::auth::Authenticator;
use crate::error::SignalingError;
use crate::room::{Outbound, PeerChannel, RoomRegistry};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, drop them early.
pub const CHANNEL_CAPACITY: usize = 64;

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// How long a closing connection waits for queued frames to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings taken from the server config.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: RoomRegistry,
    pub authenticator: Arc<dyn Authenticator>,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Token bucket over inbound frames.
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    /// Takes one token. Returns `false` when the frame must be dropped.
    fn admit(&mut self, now: Instant) -> bool {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // Refill: RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// Whether this is the first rejection since the last admitted frame.
    fn should_warn(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}

/// Answer for a frame refused by the rate limiter. Requests are told so
/// right away; notifications and garbage are dropped.
fn throttled_response(text: &str) -> Option<Response> {
    let correlation_id = match Inbound::parse(text) {
        Ok(inbound) => inbound.correlation_id,
        Err(Rejected { correlation_id, .. }) => correlation_id,
    }?;
    let error = SignalingError::Conflict(format!(
        "rate limited: max {RATE_LIMIT_REFILL_RATE} messages/second"
    ));
    Some(Response::failure(correlation_id, &error))
}

/// Serialize a response and queue it behind the notifications already sent.
fn send_response(sender: &PeerChannel, response: &Response) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if let Err(e) = sender.try_send(Outbound::Text(Arc::new(json))) {
                warn!("Dropping response {}: {}", response.correlation_id, e);
            }
        }
        Err(e) => warn!("Failed to serialize response {}: {}", response.correlation_id, e),
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    ctx: ConnectionContext,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4();
    info!("New WebSocket connection: {}", connection_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    // Spawn task to send messages to client
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(json) => {
                    if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("Send task finished for connection: {}", connection_id);
    });
    let mut send_finished = false;

    let mut session = Session::new(
        ctx.registry.clone(),
        ctx.authenticator.clone(),
        tx.clone(),
        ctx.request_timeout,
    );
    let mut limiter = RateLimiter::new(Instant::now());

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(ctx.idle_timeout, ws_receiver.next()) => next,
            _ = &mut send_task => {
                // The server closed this channel, e.g. after a kick.
                send_finished = true;
                break;
            }
        };

        // Idle timeout: close connection if no message within idle_timeout
        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if !limiter.admit(Instant::now()) {
                    if limiter.should_warn() {
                        warn!(
                            "Rate limit exceeded for connection {}: max {} messages/second",
                            connection_id, RATE_LIMIT_REFILL_RATE
                        );
                    }
                    if let Some(response) = throttled_response(text.as_str()) {
                        send_response(&tx, &response);
                    }
                    continue;
                }

                if let Some(response) = session.handle_text(text.as_str()).await {
                    send_response(&tx, &response);
                }
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                warn!("Unexpected binary frame from connection {}", connection_id);
            }
        }
    }

    session.close();
    drop(session);
    drop(tx);

    // _permit dropped here → release semaphore
    if !send_finished && tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        debug!("Send task for {} still draining, detaching", connection_id);
    }

    info!("Connection handler finished for connection: {}", connection_id);
}
