//! Media adapter: per-peer glue between signaling and the engine.
//!
//! Owns the bookkeeping around engine calls: transports, the producer and
//! consumers a peer holds are recorded on its session so teardown can close
//! them. Ownership is enforced here: a peer can only connect, produce on or
//! resume resources recorded on its own session. References to unknown
//! engine resources are ignored rather than failed; they are expected
//! during teardown races.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::{EngineError, MediaEngine, ProducerCreated, TransportParameters};
use crate::errors::CoordinatorError;
use crate::session::{PeerRegistry, ProducerRecord};
use crate::signaling::TransportDirection;

/// Connection-facing media operations.
pub struct MediaAdapter {
    registry: Arc<PeerRegistry>,
    engine: Arc<dyn MediaEngine>,
}

impl MediaAdapter {
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>, engine: Arc<dyn MediaEngine>) -> Self {
        Self { registry, engine }
    }

    /// Router capabilities, forwarded verbatim.
    pub async fn router_capabilities(&self) -> Result<Value, CoordinatorError> {
        Ok(self.engine.router_capabilities().await?)
    }

    /// Create a transport for the peer and record it under the requested
    /// direction.
    pub async fn create_transport(
        &self,
        connection_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportParameters, CoordinatorError> {
        let session = self
            .registry
            .session(connection_id)
            .await
            .ok_or_else(|| CoordinatorError::PeerNotFound(connection_id.to_string()))?;

        let parameters = self.engine.create_transport().await?;

        let mut session = session.lock().await;
        session.record_transport(parameters.id.clone(), direction);
        debug!(
            target: "ptt.media",
            connection_id,
            transport_id = %parameters.id,
            ?direction,
            "Transport created"
        );
        Ok(parameters)
    }

    /// Finish the DTLS handshake. A transport id the peer does not own, or
    /// one already gone on the engine, is ignored.
    pub async fn connect_transport(
        &self,
        connection_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), CoordinatorError> {
        if !self.owns_transport(connection_id, transport_id).await {
            debug!(
                target: "ptt.media",
                connection_id, transport_id, "connect-transport for unowned transport, ignored"
            );
            return Ok(());
        }
        match self
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await
        {
            Ok(()) | Err(EngineError::UnknownTransport(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the peer's receive capabilities. The caller follows up with a
    /// fan-out reconcile.
    pub async fn record_capabilities(
        &self,
        connection_id: &str,
        rtp_capabilities: Value,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .registry
            .session(connection_id)
            .await
            .ok_or_else(|| CoordinatorError::PeerNotFound(connection_id.to_string()))?;
        session.lock().await.rtp_capabilities = Some(rtp_capabilities);
        Ok(())
    }

    /// Create the speaker's producer on their send transport and record it.
    /// Floor ownership is checked by the caller against the room actor
    /// before this runs.
    pub async fn produce(
        &self,
        connection_id: &str,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> Result<ProducerCreated, CoordinatorError> {
        if !self.owns_transport(connection_id, transport_id).await {
            return Err(CoordinatorError::PeerNotFound(connection_id.to_string()));
        }

        let created = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        match self.registry.session(connection_id).await {
            Some(session) => {
                let mut session = session.lock().await;
                // Half-duplex: one producer at a time. A leftover producer
                // means a stale state; close it.
                if let Some(stale) = session.producer.replace(ProducerRecord {
                    id: created.id.clone(),
                    kind: created.kind.clone(),
                }) {
                    warn!(
                        target: "ptt.media",
                        connection_id,
                        stale_producer = %stale.id,
                        "Replacing leftover producer"
                    );
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        let _ = engine.close_producer(&stale.id).await;
                    });
                }
            }
            None => {
                // Peer vanished while the engine call was in flight.
                let _ = self.engine.close_producer(&created.id).await;
                return Err(CoordinatorError::PeerNotFound(connection_id.to_string()));
            }
        }
        Ok(created)
    }

    /// Close a producer and clear it from the owning session. Idempotent.
    pub async fn close_producer(&self, connection_id: &str, producer_id: &str) {
        if let Some(session) = self.registry.session(connection_id).await {
            let mut session = session.lock().await;
            if session.producer.as_ref().map(|p| p.id.as_str()) == Some(producer_id) {
                session.producer = None;
            }
        }
        match self.engine.close_producer(producer_id).await {
            Ok(()) | Err(EngineError::UnknownProducer(_)) => {}
            Err(e) => warn!(
                target: "ptt.media",
                connection_id, producer_id, error = %e, "close_producer failed"
            ),
        }
        // The engine closes the producer's consumers with it; drop the
        // listeners' records so long-lived sessions do not accumulate them.
        self.registry.prune_consumers_of(producer_id).await;
    }

    /// Resume every consumer the peer holds (unmute). Per-consumer engine
    /// failures are logged; the rest proceed.
    pub async fn resume_all(&self, connection_id: &str) {
        for consumer_id in self.consumer_ids(connection_id).await {
            match self.engine.resume_consumer(&consumer_id).await {
                Ok(()) | Err(EngineError::UnknownConsumer(_)) => {}
                Err(e) => warn!(
                    target: "ptt.media",
                    connection_id, %consumer_id, error = %e, "resume failed"
                ),
            }
        }
    }

    /// Pause every consumer the peer holds (mute).
    pub async fn pause_all(&self, connection_id: &str) {
        for consumer_id in self.consumer_ids(connection_id).await {
            match self.engine.pause_consumer(&consumer_id).await {
                Ok(()) | Err(EngineError::UnknownConsumer(_)) => {}
                Err(e) => warn!(
                    target: "ptt.media",
                    connection_id, %consumer_id, error = %e, "pause failed"
                ),
            }
        }
    }

    async fn consumer_ids(&self, connection_id: &str) -> Vec<String> {
        match self.registry.session(connection_id).await {
            Some(session) => session
                .lock()
                .await
                .consumers
                .values()
                .map(|c| c.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    async fn owns_transport(&self, connection_id: &str, transport_id: &str) -> bool {
        match self.registry.session(connection_id).await {
            Some(session) => session.lock().await.transports.contains_key(transport_id),
            None => false,
        }
    }
}
