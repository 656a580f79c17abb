//! Peer session registry.
//!
//! One [`PeerSession`] per live signaling connection, keyed by connection
//! id. Identity (device, company) and the outbound event sender live in the
//! registry entry and never need the session lock; mutable media state sits
//! behind a per-peer `Mutex` so media calls for different peers proceed in
//! parallel while calls for one peer serialize.
//!
//! Lock discipline: never hold two session locks at once, and never await
//! the media engine while holding one. Callers snapshot what they need,
//! drop the lock, await, then re-take and re-check.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::engine::{ConsumerParameters, EngineError, MediaEngine};
use crate::signaling::{ServerEvent, TransportDirection};

/// Sender half of a connection's outbound event queue. The socket writer
/// task drains the other half; a send failure means the socket is gone.
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

/// A transport created for this peer.
#[derive(Debug, Clone, Copy)]
pub struct TransportRecord {
    pub direction: TransportDirection,
}

/// The peer's single audio producer, when speaking.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: String,
    pub kind: String,
}

/// Mutable per-connection media state.
#[derive(Debug)]
pub struct PeerSession {
    pub connection_id: String,
    pub device_id: String,
    pub company_id: String,
    pub display_name: String,

    /// Room the peer currently occupies, if any.
    pub room_id: Option<String>,

    /// Receive capabilities, recorded once the client reports them.
    pub rtp_capabilities: Option<Value>,

    /// Transports owned by this peer, keyed by engine transport id.
    pub transports: HashMap<String, TransportRecord>,
    pub send_transport_id: Option<String>,
    pub recv_transport_id: Option<String>,

    /// At most one producer (half-duplex: audio only while speaking).
    pub producer: Option<ProducerRecord>,

    /// Consumers keyed by the producer they consume. Keying by producer is
    /// what makes fan-out reconciliation idempotent.
    pub consumers: HashMap<String, ConsumerParameters>,
}

impl PeerSession {
    /// Whether the peer can receive fan-out: recv transport up and
    /// capabilities recorded.
    #[must_use]
    pub fn ready_to_consume(&self) -> bool {
        self.recv_transport_id.is_some() && self.rtp_capabilities.is_some()
    }

    /// Record a new transport and remember direction slots.
    pub fn record_transport(&mut self, transport_id: String, direction: TransportDirection) {
        match direction {
            TransportDirection::Send => self.send_transport_id = Some(transport_id.clone()),
            TransportDirection::Recv => self.recv_transport_id = Some(transport_id.clone()),
        }
        self.transports
            .insert(transport_id, TransportRecord { direction });
    }

    /// Engine resource ids to tear down, in close order (consumers, then
    /// producer, then transports).
    fn drain_resources(&mut self) -> MediaResources {
        MediaResources {
            consumer_ids: self.consumers.drain().map(|(_, c)| c.id).collect(),
            producer_id: self.producer.take().map(|p| p.id),
            transport_ids: self.transports.drain().map(|(id, _)| id).collect(),
        }
    }

    /// Clear all media state, returning what must be closed on the engine.
    fn reset_media(&mut self) -> MediaResources {
        let resources = self.drain_resources();
        self.send_transport_id = None;
        self.recv_transport_id = None;
        self.rtp_capabilities = None;
        resources
    }
}

/// Engine resources collected under the session lock, closed after it is
/// released.
#[derive(Debug, Default)]
struct MediaResources {
    consumer_ids: Vec<String>,
    producer_id: Option<String>,
    transport_ids: Vec<String>,
}

/// Immutable registry entry: identity and the outbound sender, readable
/// without the session lock.
#[derive(Clone)]
pub struct PeerEntry {
    pub device_id: String,
    pub company_id: String,
    pub display_name: String,
    pub outbound: OutboundSender,
    pub session: Arc<Mutex<PeerSession>>,
}

/// Registry of live peer sessions, keyed by connection id.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerEntry>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection. Replaces any stale entry with
    /// the same connection id.
    pub async fn register(
        &self,
        connection_id: String,
        device_id: String,
        company_id: String,
        display_name: String,
        outbound: OutboundSender,
    ) -> Arc<Mutex<PeerSession>> {
        let session = Arc::new(Mutex::new(PeerSession {
            connection_id: connection_id.clone(),
            device_id: device_id.clone(),
            company_id: company_id.clone(),
            display_name: display_name.clone(),
            room_id: None,
            rtp_capabilities: None,
            transports: HashMap::new(),
            send_transport_id: None,
            recv_transport_id: None,
            producer: None,
            consumers: HashMap::new(),
        }));

        let entry = PeerEntry {
            device_id,
            company_id,
            display_name,
            outbound,
            session: Arc::clone(&session),
        };
        self.peers.write().await.insert(connection_id, entry);
        session
    }

    pub async fn entry(&self, connection_id: &str) -> Option<PeerEntry> {
        self.peers.read().await.get(connection_id).cloned()
    }

    pub async fn session(&self, connection_id: &str) -> Option<Arc<Mutex<PeerSession>>> {
        self.peers
            .read()
            .await
            .get(connection_id)
            .map(|e| Arc::clone(&e.session))
    }

    /// Push an event to a connection. A closed socket is not an error; the
    /// disconnect path will clean the entry up.
    pub async fn send(&self, connection_id: &str, event: ServerEvent) {
        if let Some(entry) = self.peers.read().await.get(connection_id) {
            if entry.outbound.send(event).is_err() {
                debug!(
                    target: "ptt.session",
                    connection_id, "Outbound channel closed, event dropped"
                );
            }
        }
    }

    /// Entries for a set of connection ids (room fan-out).
    pub async fn entries_for(&self, connection_ids: &[String]) -> Vec<(String, PeerEntry)> {
        let peers = self.peers.read().await;
        connection_ids
            .iter()
            .filter_map(|id| peers.get(id).map(|e| (id.clone(), e.clone())))
            .collect()
    }

    /// Live connections of one device (targeted paging).
    pub async fn connections_of_device(&self, device_id: &str) -> Vec<(String, PeerEntry)> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.device_id == device_id)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// All live entries (paging, health).
    pub async fn all_entries(&self) -> Vec<(String, PeerEntry)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Drop every session's consumer record for a closed producer. The
    /// engine already closed those consumers along with the producer; only
    /// the bookkeeping remains.
    pub async fn prune_consumers_of(&self, producer_id: &str) {
        let sessions: Vec<Arc<Mutex<PeerSession>>> = self
            .peers
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        for session in sessions {
            session.lock().await.consumers.remove(producer_id);
        }
    }

    /// Release all media for a connection but keep it registered (used by
    /// `leave-room`; the socket stays up for paging). Engine close failures
    /// are logged and swallowed: `Unknown*` just means the resource is
    /// already gone.
    pub async fn release_media(&self, connection_id: &str, engine: &dyn MediaEngine) {
        let Some(session) = self.session(connection_id).await else {
            return;
        };
        let resources = {
            let mut session = session.lock().await;
            session.room_id = None;
            session.reset_media()
        };
        close_resources(connection_id, engine, resources).await;
    }

    /// Remove a connection entirely, closing its engine resources.
    pub async fn remove(&self, connection_id: &str, engine: &dyn MediaEngine) {
        let entry = self.peers.write().await.remove(connection_id);
        let Some(entry) = entry else { return };
        let resources = entry.session.lock().await.reset_media();
        close_resources(connection_id, engine, resources).await;
    }
}

async fn close_resources(connection_id: &str, engine: &dyn MediaEngine, r: MediaResources) {
    for consumer_id in &r.consumer_ids {
        log_close(connection_id, engine.close_consumer(consumer_id).await);
    }
    if let Some(producer_id) = &r.producer_id {
        log_close(connection_id, engine.close_producer(producer_id).await);
    }
    for transport_id in &r.transport_ids {
        log_close(connection_id, engine.close_transport(transport_id).await);
    }
}

fn log_close(connection_id: &str, result: Result<(), EngineError>) {
    match result {
        Ok(())
        | Err(EngineError::UnknownTransport(_))
        | Err(EngineError::UnknownProducer(_))
        | Err(EngineError::UnknownConsumer(_)) => {}
        Err(e) => warn!(
            target: "ptt.session",
            connection_id, error = %e, "Engine close failed during teardown"
        ),
    }
}
