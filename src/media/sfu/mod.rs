#![forbid(unsafe_code)]

// mediasoup-backed MediaEngine
//
// Engine objects are kept in id-indexed maps behind short std locks that
// are never held across an await. Dropping the last handle closes the
// object inside mediasoup, so `close` only has to forget it.

pub mod config;
pub mod workers;

pub use config::MediaConfig;

use super::{
    ConsumerParams, Layers, MediaEngine, MediaError, MediaEvent, MediaKind, MediaObject,
    MediaResult, TransportDirection, TransportParams,
};
use async_trait::async_trait;
use mediasoup::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions};
use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::consumer::ConsumerLayers;
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use workers::{WorkerLease, WorkerPool};

const AUDIO_LEVEL_INTERVAL_MS: u16 = 800;
const AUDIO_LEVEL_MAX_ENTRIES: NonZeroU16 = match NonZeroU16::new(10) {
    Some(entries) => entries,
    None => panic!("max entries must be non-zero"),
};

struct RouterEntry {
    router: Router,
    webrtc_server: WebRtcServer,
    events: mpsc::Sender<MediaEvent>,
    active_speaker: Option<ActiveSpeakerObserver>,
    audio_levels: Option<AudioLevelObserver>,
    _lease: WorkerLease,
}

struct TransportEntry {
    transport: WebRtcTransport,
    router_id: String,
}

#[derive(Default)]
struct Objects {
    routers: HashMap<String, RouterEntry>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

pub struct MediasoupEngine {
    pool: WorkerPool,
    config: MediaConfig,
    objects: StdMutex<Objects>,
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, value: Value) -> MediaResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MediaError::InvalidParameters(format!("invalid {what}: {e}")))
}

fn encode<T: serde::Serialize>(what: &str, value: &T) -> MediaResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| MediaError::InvalidParameters(format!("unserializable {what}: {e}")))
}

impl MediasoupEngine {
    /// Starts the worker pool.
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn new(config: MediaConfig) -> MediaResult<Arc<Self>> {
        let pool = WorkerPool::new(&config).await?;
        Ok(Arc::new(Self {
            pool,
            config,
            objects: StdMutex::new(Objects::default()),
        }))
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn router(&self, router_id: &str) -> MediaResult<(Router, WebRtcServer)> {
        let objects = self.objects();
        let entry = objects
            .routers
            .get(router_id)
            .ok_or_else(|| MediaError::NotFound(format!("router {router_id}")))?;
        Ok((entry.router.clone(), entry.webrtc_server.clone()))
    }

    fn transport(&self, transport_id: &str) -> MediaResult<WebRtcTransport> {
        self.objects()
            .transports
            .get(transport_id)
            .map(|entry| entry.transport.clone())
            .ok_or_else(|| MediaError::NotFound(format!("transport {transport_id}")))
    }

    fn producer(&self, producer_id: &str) -> MediaResult<Producer> {
        self.objects()
            .producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::NotFound(format!("producer {producer_id}")))
    }

    fn consumer(&self, consumer_id: &str) -> MediaResult<Consumer> {
        self.objects()
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| MediaError::NotFound(format!("consumer {consumer_id}")))
    }

    async fn create_observers(
        &self,
        room_id: &str,
        router: &Router,
        events: &mpsc::Sender<MediaEvent>,
    ) -> (Option<ActiveSpeakerObserver>, Option<AudioLevelObserver>) {
        let active_speaker = match router
            .create_active_speaker_observer(ActiveSpeakerObserverOptions::default())
            .await
        {
            Ok(observer) => {
                let tx = events.clone();
                observer
                    .on_dominant_speaker(move |speaker| {
                        let _ = tx.try_send(MediaEvent::DominantSpeaker {
                            producer_id: speaker.producer.id().to_string(),
                        });
                    })
                    .detach();
                Some(observer)
            }
            Err(e) => {
                warn!("Failed to create active speaker observer for room {}: {}", room_id, e);
                None
            }
        };

        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = AUDIO_LEVEL_MAX_ENTRIES;
        options.threshold = self.config.audio_level_threshold;
        options.interval = AUDIO_LEVEL_INTERVAL_MS;
        let audio_levels = match router.create_audio_level_observer(options).await {
            Ok(observer) => {
                let tx = events.clone();
                observer
                    .on_volumes(move |volumes| {
                        // Dropping stale levels is fine.
                        for volume in volumes {
                            let _ = tx.try_send(MediaEvent::AudioLevel {
                                producer_id: volume.producer.id().to_string(),
                                volume: volume.volume,
                            });
                        }
                    })
                    .detach();
                let tx = events.clone();
                observer
                    .on_silence(move || {
                        let _ = tx.try_send(MediaEvent::Silence);
                    })
                    .detach();
                Some(observer)
            }
            Err(e) => {
                warn!("Failed to create audio level observer for room {}: {}", room_id, e);
                None
            }
        };

        (active_speaker, audio_levels)
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(
        &self,
        room_id: &str,
        events: mpsc::Sender<MediaEvent>,
    ) -> MediaResult<String> {
        let lease = self.pool.lease()?;
        let router = lease
            .worker
            .create_router(self.config.router_config.to_router_options())
            .await
            .map_err(|e| MediaError::Router(format!("Failed to create router: {e}")))?;
        let router_id = router.id().to_string();

        let room = room_id.to_string();
        router
            .on_worker_close(move || {
                warn!("Worker closed for router in room: {}", room);
            })
            .detach();

        let (active_speaker, audio_levels) = self.create_observers(room_id, &router, &events).await;
        info!("Created router {} for room {} on worker {}", router_id, room_id, lease.worker.id());

        self.objects().routers.insert(
            router_id.clone(),
            RouterEntry {
                webrtc_server: lease.webrtc_server.clone(),
                router,
                events,
                active_speaker,
                audio_levels,
                _lease: lease,
            },
        );
        Ok(router_id)
    }

    async fn close_router(&self, router_id: &str) {
        let mut objects = self.objects();
        if objects.routers.remove(router_id).is_some() {
            objects.transports.retain(|_, entry| entry.router_id != router_id);
            info!("Closed router {}", router_id);
        }
    }

    async fn rtp_capabilities(&self, router_id: &str) -> MediaResult<Value> {
        let (router, _) = self.router(router_id)?;
        encode("rtp capabilities", router.rtp_capabilities())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams> {
        let (router, webrtc_server) = self.router(router_id)?;

        let mut options = WebRtcTransportOptions::new_with_server(webrtc_server);
        options.enable_sctp = direction == TransportDirection::Send;
        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to create transport: {e}")))?;

        let transport_id = transport.id().to_string();
        let params = TransportParams {
            id: transport_id.clone(),
            ice_parameters: encode("ice parameters", transport.ice_parameters())?,
            ice_candidates: encode("ice candidates", transport.ice_candidates())?,
            dtls_parameters: encode("dtls parameters", &transport.dtls_parameters())?,
            sctp_parameters: match transport.sctp_parameters() {
                Some(sctp) => Some(encode("sctp parameters", &sctp)?),
                None => None,
            },
        };

        let id = transport_id.clone();
        transport
            .on_dtls_state_change(move |state| {
                debug!("Transport {} DTLS state: {:?}", id, state);
            })
            .detach();

        self.objects().transports.insert(
            transport_id.clone(),
            TransportEntry {
                transport,
                router_id: router_id.to_string(),
            },
        );
        info!("Created {} transport {} on router {}", direction.as_str(), transport_id, router_id);
        Ok(params)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let transport = self.transport(transport_id)?;
        let dtls_parameters: DtlsParameters = decode("dtlsParameters", dtls_parameters)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to connect transport: {e}")))?;
        info!("Connected transport {}", transport_id);
        Ok(())
    }

    async fn restart_ice(&self, transport_id: &str) -> MediaResult<Value> {
        let transport = self.transport(transport_id)?;
        let ice_parameters = transport
            .restart_ice()
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to restart ICE: {e}")))?;
        encode("ice parameters", &ice_parameters)
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        paused: bool,
    ) -> MediaResult<String> {
        let kind = match kind {
            MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
            MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
            MediaKind::Data => {
                return Err(MediaError::InvalidParameters(
                    "data channels are not routed by this engine".to_string(),
                ))
            }
        };
        let transport = self.transport(transport_id)?;
        let rtp_parameters: RtpParameters = decode("rtpParameters", rtp_parameters)?;

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.paused = paused;
        let producer = transport
            .produce(options)
            .await
            .map_err(|e| MediaError::Producer(format!("Failed to create producer: {e}")))?;
        let producer_id = producer.id().to_string();

        let observers = {
            let objects = self.objects();
            objects
                .transports
                .get(transport_id)
                .and_then(|entry| objects.routers.get(&entry.router_id))
                .map(|router| (router.active_speaker.clone(), router.audio_levels.clone()))
        };
        if let (mediasoup::rtp_parameters::MediaKind::Audio, Some((active, levels))) = (kind, observers) {
            if let Some(observer) = active {
                if let Err(e) = observer
                    .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                    .await
                {
                    warn!("Failed to observe producer {} for speech: {}", producer_id, e);
                }
            }
            if let Some(observer) = levels {
                if let Err(e) = observer
                    .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                    .await
                {
                    warn!("Failed to observe producer {} levels: {}", producer_id, e);
                }
            }
        }

        self.objects().producers.insert(producer_id.clone(), producer);
        info!("Created {:?} producer {} on transport {}", kind, producer_id, transport_id);
        Ok(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        let (transport, events) = {
            let objects = self.objects();
            let entry = objects
                .transports
                .get(transport_id)
                .ok_or_else(|| MediaError::NotFound(format!("transport {transport_id}")))?;
            let events = objects
                .routers
                .get(&entry.router_id)
                .map(|router| router.events.clone());
            (entry.transport.clone(), events)
        };
        let producer = self.producer(producer_id)?;
        let rtp_capabilities: RtpCapabilities = decode("rtpCapabilities", rtp_capabilities)?;

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to create consumer: {e}")))?;
        let consumer_id = consumer.id().to_string();

        if let Some(events) = events {
            let id = consumer_id.clone();
            consumer
                .on_layers_change(move |layers| {
                    let _ = events.try_send(MediaEvent::ConsumerLayersChanged {
                        consumer_id: id.clone(),
                        layers: layers.as_ref().map(|l| Layers {
                            spatial_layer: l.spatial_layer,
                            temporal_layer: l.temporal_layer,
                        }),
                    });
                })
                .detach();
        }

        let params = ConsumerParams {
            id: consumer_id.clone(),
            kind: match consumer.kind() {
                mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
                mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
            },
            rtp_parameters: encode("rtp parameters", consumer.rtp_parameters())?,
        };
        self.objects().consumers.insert(consumer_id.clone(), consumer);
        info!("Created consumer {} for producer {}", consumer_id, producer_id);
        Ok(params)
    }

    async fn pause(&self, object: &MediaObject) -> MediaResult<()> {
        match object {
            MediaObject::Producer(id) => self
                .producer(id)?
                .pause()
                .await
                .map_err(|e| MediaError::Producer(format!("Failed to pause producer: {e}"))),
            MediaObject::Consumer(id) => self
                .consumer(id)?
                .pause()
                .await
                .map_err(|e| MediaError::Consumer(format!("Failed to pause consumer: {e}"))),
            MediaObject::Transport(id) => Err(MediaError::InvalidParameters(format!(
                "transport {id} cannot be paused"
            ))),
        }
    }

    async fn resume(&self, object: &MediaObject) -> MediaResult<()> {
        match object {
            MediaObject::Producer(id) => self
                .producer(id)?
                .resume()
                .await
                .map_err(|e| MediaError::Producer(format!("Failed to resume producer: {e}"))),
            MediaObject::Consumer(id) => self
                .consumer(id)?
                .resume()
                .await
                .map_err(|e| MediaError::Consumer(format!("Failed to resume consumer: {e}"))),
            MediaObject::Transport(id) => Err(MediaError::InvalidParameters(format!(
                "transport {id} cannot be resumed"
            ))),
        }
    }

    async fn set_preferred_layers(&self, consumer_id: &str, layers: Layers) -> MediaResult<()> {
        self.consumer(consumer_id)?
            .set_preferred_layers(ConsumerLayers {
                spatial_layer: layers.spatial_layer,
                temporal_layer: layers.temporal_layer,
            })
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to set preferred layers: {e}")))?;
        debug!("Set preferred layers {:?} for consumer {}", layers, consumer_id);
        Ok(())
    }

    async fn stats(&self, object: &MediaObject) -> MediaResult<Value> {
        match object {
            MediaObject::Transport(id) => {
                let stats = self
                    .transport(id)?
                    .get_stats()
                    .await
                    .map_err(|e| MediaError::Transport(format!("Failed to get transport stats: {e}")))?;
                encode("transport stats", &stats)
            }
            MediaObject::Producer(id) => {
                let stats = self
                    .producer(id)?
                    .get_stats()
                    .await
                    .map_err(|e| MediaError::Producer(format!("Failed to get producer stats: {e}")))?;
                encode("producer stats", &stats)
            }
            MediaObject::Consumer(id) => {
                let stats = self
                    .consumer(id)?
                    .get_stats()
                    .await
                    .map_err(|e| MediaError::Consumer(format!("Failed to get consumer stats: {e}")))?;
                encode("consumer stats", &stats)
            }
        }
    }

    async fn close(&self, object: &MediaObject) {
        let mut objects = self.objects();
        let closed = match object {
            MediaObject::Transport(id) => objects.transports.remove(id).is_some(),
            MediaObject::Producer(id) => objects.producers.remove(id).is_some(),
            MediaObject::Consumer(id) => objects.consumers.remove(id).is_some(),
        };
        if closed {
            debug!("Closed {}", object);
        }
    }
}
