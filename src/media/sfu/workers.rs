#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use super::config::MediaConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// One mediasoup worker and the WebRtcServer every transport on it shares.
struct PooledWorker {
    worker: Worker,
    webrtc_server: WebRtcServer,
    routers: Arc<AtomicUsize>,
}

/// A worker picked for a new router. Dropping it releases the router slot.
pub struct WorkerLease {
    pub worker: Worker,
    pub webrtc_server: WebRtcServer,
    routers: Arc<AtomicUsize>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.routers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fixed pool of mediasoup workers
pub struct WorkerPool {
    workers: Vec<PooledWorker>,
    _manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerPool {
    /// Creates `num_workers` workers, each with its own WebRtcServer.
    ///
    /// # Errors
    /// Returns an error if a worker or its WebRtcServer cannot be created
    pub async fn new(config: &MediaConfig) -> MediaResult<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating worker pool with {} workers", num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker = manager
                .create_worker(config.worker_config.to_worker_settings())
                .await
                .map_err(|e| MediaError::Worker(format!("Failed to create worker: {e}")))?;
            let worker_id = worker.id();
            Self::setup_worker_handlers(&worker, index);

            let listen_infos = WebRtcServerListenInfos::new(
                config.webrtc_server_listen_info(index, Protocol::Udp),
            )
            .insert(config.webrtc_server_listen_info(index, Protocol::Tcp));
            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(listen_infos))
                .await
                .map_err(|e| {
                    MediaError::Worker(format!(
                        "Failed to create WebRtcServer for worker {worker_id}: {e}"
                    ))
                })?;
            info!(
                "Created worker {} (index {}) with WebRtcServer on port {}",
                worker_id,
                index,
                config.webrtc_server_port_base.saturating_add(index as u16)
            );

            workers.push(PooledWorker {
                worker,
                webrtc_server,
                routers: Arc::new(AtomicUsize::new(0)),
            });
        }

        Ok(Self {
            workers,
            _manager: manager,
        })
    }

    fn setup_worker_handlers(worker: &Worker, index: usize) {
        let worker_id: WorkerId = worker.id();
        worker
            .on_dead(move |_reason| {
                error!("Worker {} (index {}) died!", worker_id, index);
            })
            .detach();
    }

    /// Picks the live worker hosting the fewest routers.
    pub fn lease(&self) -> MediaResult<WorkerLease> {
        let chosen = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, pooled)| !pooled.worker.closed())
            .min_by_key(|(_, pooled)| pooled.routers.load(Ordering::Relaxed))
            .ok_or_else(|| MediaError::Worker("No workers available".to_string()))?;

        let (index, pooled) = chosen;
        let load = pooled.routers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Selected worker {} (index {}, {} routers)", pooled.worker.id(), index, load);

        Ok(WorkerLease {
            worker: pooled.worker.clone(),
            webrtc_server: pooled.webrtc_server.clone(),
            routers: pooled.routers.clone(),
        })
    }
}
