#![forbid(unsafe_code)]

// Media adapter - thin capability layer over the mediasoup engine.
//
// One global worker is created at startup and reused by every router. Routers
// are per-room; transports, producers, and consumers are created directly on
// the handles this module hands out.

pub mod config;
pub mod types;

pub use config::{AudioObserverConfig, MediaConfig, RouterConfig, TransportConfig, WorkerConfig};
pub use types::{MediaError, MediaResult, TransportInfo};

use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::sync::Arc;
use tracing::{error, info};

/// The single global media worker and the fixed configuration applied to
/// everything created on it.
pub struct MediaWorker {
    /// Keeps the engine's manager alive for the worker's whole lifetime.
    _manager: WorkerManager,
    worker: Worker,
    config: Arc<MediaConfig>,
}

impl MediaWorker {
    /// Spawns the worker subprocess.
    ///
    /// # Errors
    /// Returns an error if the worker cannot be spawned.
    pub async fn new(config: MediaConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let manager = WorkerManager::new();

        let worker = manager
            .create_worker(config.worker.to_worker_settings())
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        info!(
            "Media worker {} started (RTC ports {}-{})",
            worker.id(),
            config.worker.rtc_min_port,
            config.worker.rtc_max_port
        );

        worker
            .on_dead(|reason| {
                error!("Media worker died: {:?}", reason);
            })
            .detach();

        Ok(Self {
            _manager: manager,
            worker,
            config,
        })
    }

    /// Creates a router with the fixed codec set.
    pub async fn create_router(&self) -> MediaResult<Router> {
        let router = self
            .worker
            .create_router(self.config.router.to_router_options())
            .await
            .map_err(|e| MediaError::Router(e.to_string()))?;

        info!("Created router {}", router.id());
        Ok(router)
    }

    /// Creates an audio-level observer bound to `router`.
    pub async fn create_audio_observer(&self, router: &Router) -> MediaResult<AudioLevelObserver> {
        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = self.config.audio_observer.max_entries;
        options.threshold = self.config.audio_observer.threshold;
        options.interval = self.config.audio_observer.interval;

        router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| MediaError::Observer(e.to_string()))
    }

    /// Options for a new WebRTC transport on any of this worker's routers.
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        self.config.transport.to_transport_options()
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }
}
