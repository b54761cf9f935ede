#![forbid(unsafe_code)]

// In-memory media engine for tests

use super::{
    ConsumerParams, Layers, MediaEngine, MediaError, MediaEvent, MediaKind, MediaObject,
    MediaResult, TransportDirection, TransportParams,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Deterministic engine: ids are `<kind>-<n>`, every operation can be
/// delayed or forced to fail by name, and every call is logged.
#[derive(Default)]
pub struct MockMediaEngine {
    next_id: AtomicU64,
    delays: Mutex<HashMap<&'static str, Duration>>,
    failures: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
    closed: Mutex<Vec<MediaObject>>,
    routers: Mutex<HashMap<String, mpsc::Sender<MediaEvent>>>,
    producer_kinds: Mutex<HashMap<String, MediaKind>>,
}

impl MockMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay(&self, op: &'static str, by: Duration) {
        self.delays.lock().unwrap().insert(op, by);
    }

    pub fn fail(&self, op: &'static str) {
        self.failures.lock().unwrap().insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<MediaObject> {
        self.closed.lock().unwrap().clone()
    }

    pub fn open_routers(&self) -> usize {
        self.routers.lock().unwrap().len()
    }

    /// Pushes an event into every open router's channel.
    pub async fn emit(&self, event: MediaEvent) {
        let senders: Vec<_> = self.routers.lock().unwrap().values().cloned().collect();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn enter(&self, op: &'static str, detail: &str) -> MediaResult<()> {
        self.calls.lock().unwrap().push(format!("{op} {detail}"));
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.lock().unwrap().contains(op) {
            return Err(MediaError::InvalidParameters(format!("{op} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_router(
        &self,
        room_id: &str,
        events: mpsc::Sender<MediaEvent>,
    ) -> MediaResult<String> {
        self.enter("create_router", room_id).await?;
        let id = self.id("router");
        self.routers.lock().unwrap().insert(id.clone(), events);
        Ok(id)
    }

    async fn close_router(&self, router_id: &str) {
        self.calls.lock().unwrap().push(format!("close_router {router_id}"));
        self.routers.lock().unwrap().remove(router_id);
    }

    async fn rtp_capabilities(&self, router_id: &str) -> MediaResult<Value> {
        self.enter("rtp_capabilities", router_id).await?;
        Ok(json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] }))
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams> {
        self.enter("create_webrtc_transport", router_id).await?;
        Ok(TransportParams {
            id: self.id("transport"),
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            sctp_parameters: (direction == TransportDirection::Send).then(|| json!({ "port": 5000 })),
        })
    }

    async fn connect_transport(&self, transport_id: &str, _dtls_parameters: Value) -> MediaResult<()> {
        self.enter("connect_transport", transport_id).await
    }

    async fn restart_ice(&self, transport_id: &str) -> MediaResult<Value> {
        self.enter("restart_ice", transport_id).await?;
        Ok(json!({ "usernameFragment": "restarted", "password": "restarted" }))
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: Value,
        _paused: bool,
    ) -> MediaResult<String> {
        self.enter("produce", transport_id).await?;
        let id = self.id("producer");
        self.producer_kinds.lock().unwrap().insert(id.clone(), kind);
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        self.enter("consume", transport_id).await?;
        let kind = self
            .producer_kinds
            .lock()
            .unwrap()
            .get(producer_id)
            .copied()
            .ok_or_else(|| MediaError::NotFound(format!("producer {producer_id}")))?;
        Ok(ConsumerParams {
            id: self.id("consumer"),
            kind,
            rtp_parameters: json!({ "mid": "0" }),
        })
    }

    async fn pause(&self, object: &MediaObject) -> MediaResult<()> {
        self.enter("pause", object.id()).await
    }

    async fn resume(&self, object: &MediaObject) -> MediaResult<()> {
        self.enter("resume", object.id()).await
    }

    async fn set_preferred_layers(&self, consumer_id: &str, _layers: Layers) -> MediaResult<()> {
        self.enter("set_preferred_layers", consumer_id).await
    }

    async fn stats(&self, object: &MediaObject) -> MediaResult<Value> {
        self.enter("stats", object.id()).await?;
        Ok(json!([{ "id": object.id(), "bytesReceived": 0 }]))
    }

    async fn close(&self, object: &MediaObject) {
        self.calls.lock().unwrap().push(format!("close {}", object.id()));
        if let MediaObject::Producer(id) = object {
            self.producer_kinds.lock().unwrap().remove(id);
        }
        self.closed.lock().unwrap().push(object.clone());
    }
}
