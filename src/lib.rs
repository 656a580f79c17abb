//! Push-to-talk voice session coordinator.
//!
//! Brokers half-duplex voice rooms over WebSocket signaling: one speaker
//! per room at a time, everyone else listens. The media plane itself lives
//! in an external SFU; this service owns arbitration, membership and the
//! bookkeeping that ties client transports, producers and consumers
//! together.

pub mod actors;
pub mod config;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod fanout;
pub mod media;
pub mod observability;
pub mod rest;
pub mod session;
pub mod signaling;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use actors::{CoordinatorActor, CoordinatorHandle, CoordinatorMetrics};
use config::Config;
use directory::token::TokenService;
use directory::DirectoryStore;
use engine::MediaEngine;
use errors::CoordinatorError;
use fanout::FanoutCoordinator;
use media::MediaAdapter;
use session::PeerRegistry;

/// Shared handles threaded through the signaling and REST layers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PeerRegistry>,
    pub directory: Arc<DirectoryStore>,
    pub tokens: Arc<TokenService>,
    pub coordinator: CoordinatorHandle,
    pub media: Arc<MediaAdapter>,
    pub fanout: Arc<FanoutCoordinator>,
    pub engine: Arc<dyn MediaEngine>,
    pub metrics: Arc<CoordinatorMetrics>,
}

impl AppState {
    /// Wire up the full service graph. Returns the state plus the
    /// coordinator actor's join handle for shutdown supervision.
    pub async fn build(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        root_token: &CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), CoordinatorError> {
        let directory = Arc::new(DirectoryStore::open(config.data_path.clone()).await?);
        let tokens = Arc::new(TokenService::new(
            &config.jwt_secret,
            config.token_ttl_seconds,
        ));
        let registry = Arc::new(PeerRegistry::new());
        let metrics = CoordinatorMetrics::new();

        let (coordinator, coordinator_task) =
            CoordinatorActor::spawn(root_token, Arc::clone(&metrics));

        let media = Arc::new(MediaAdapter::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
        ));
        let fanout = Arc::new(FanoutCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&engine),
        ));

        Ok((
            Self {
                registry,
                directory,
                tokens,
                coordinator,
                media,
                fanout,
                engine,
                metrics,
            },
            coordinator_task,
        ))
    }
}
