#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[cfg(feature = "mediasoup")]
    #[error("Mediasoup error: {0}")]
    Mediasoup(#[from] mediasoup::worker::RequestError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Connection parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Negotiated parameters of a freshly created consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Simulcast/SVC layer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layers {
    pub spatial_layer: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Engine-side object addressed by pause/resume/stats/close.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaObject {
    Transport(String),
    Producer(String),
    Consumer(String),
}

impl MediaObject {
    pub fn id(&self) -> &str {
        match self {
            MediaObject::Transport(id) | MediaObject::Producer(id) | MediaObject::Consumer(id) => id,
        }
    }
}

impl fmt::Display for MediaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaObject::Transport(id) => write!(f, "transport {id}"),
            MediaObject::Producer(id) => write!(f, "producer {id}"),
            MediaObject::Consumer(id) => write!(f, "consumer {id}"),
        }
    }
}

/// Asynchronous signal raised by the engine for a router.
///
/// Delivered to the owning room and applied inside its mutation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    AudioLevel { producer_id: String, volume: i8 },
    DominantSpeaker { producer_id: String },
    Silence,
    ConsumerLayersChanged { consumer_id: String, layers: Option<Layers> },
}
