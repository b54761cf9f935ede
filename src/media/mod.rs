#![forbid(unsafe_code)]

// Media module - SFU engine abstraction
// Rooms talk to the media plane only through the MediaEngine trait

pub mod types;

#[cfg(feature = "mediasoup")]
pub mod sfu;

#[cfg(test)]
pub(crate) mod mock;

pub use types::{
    ConsumerParams, Layers, MediaError, MediaEvent, MediaKind, MediaObject, MediaResult,
    TransportDirection, TransportParams,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Capability surface of the SFU.
///
/// Negotiation payloads (RTP capabilities/parameters, DTLS and ICE
/// parameters) are opaque JSON to the signaling layer and are passed
/// through unchanged.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Creates a router for a room. Audio levels and consumer layer changes
    /// observed on it are pushed into `events`.
    async fn create_router(
        &self,
        room_id: &str,
        events: mpsc::Sender<MediaEvent>,
    ) -> MediaResult<String>;

    /// Closes a router and everything created on it.
    async fn close_router(&self, router_id: &str);

    async fn rtp_capabilities(&self, router_id: &str) -> MediaResult<Value>;

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    /// Returns fresh ICE parameters.
    async fn restart_ice(&self, transport_id: &str) -> MediaResult<Value>;

    /// Returns the new producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        paused: bool,
    ) -> MediaResult<String>;

    /// Consumers are always created paused; the client resumes them once
    /// its side is ready.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams>;

    async fn pause(&self, object: &MediaObject) -> MediaResult<()>;

    async fn resume(&self, object: &MediaObject) -> MediaResult<()>;

    async fn set_preferred_layers(&self, consumer_id: &str, layers: Layers) -> MediaResult<()>;

    async fn stats(&self, object: &MediaObject) -> MediaResult<Value>;

    /// Closing never fails; unknown objects are ignored.
    async fn close(&self, object: &MediaObject);
}
