//! Fan-out coordinator.
//!
//! Bridges an announced producer to consumers on every other eligible room
//! member. Reconciliation is trigger-driven and idempotent: it runs when a
//! producer goes live, when a peer records its receive capabilities, when a
//! peer's receive transport appears, and on explicit consume requests. The
//! per-peer consumer map is keyed by producer id, so running the same
//! reconcile twice converges instead of duplicating consumers.
//!
//! Failure policy per target: capability mismatches skip that target only;
//! an unknown producer means the speaker already stopped and the whole pass
//! quietly ends; other engine failures are logged and skip the target.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::actors::RoomHandle;
use crate::directory::DirectoryStore;
use crate::engine::{EngineError, MediaEngine};
use crate::session::PeerRegistry;
use crate::signaling::ServerEvent;

/// Creates paused consumers for room members when a producer is live.
pub struct FanoutCoordinator {
    registry: Arc<PeerRegistry>,
    directory: Arc<DirectoryStore>,
    engine: Arc<dyn MediaEngine>,
}

impl FanoutCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<PeerRegistry>,
        directory: Arc<DirectoryStore>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        Self {
            registry,
            directory,
            engine,
        }
    }

    /// A producer went live: reconcile every other member.
    pub async fn producer_live(
        &self,
        room: &RoomHandle,
        speaker_connection_id: &str,
        producer_id: &str,
        member_connection_ids: &[String],
    ) {
        for connection_id in member_connection_ids {
            if connection_id == speaker_connection_id {
                continue;
            }
            if self
                .reconcile_one(room.room_id(), connection_id, producer_id)
                .await
                .is_break()
            {
                // Producer already gone; nothing left to fan out.
                return;
            }
        }
    }

    /// A peer became (possibly) ready to consume: reconcile it against the
    /// room's active producer, if any.
    pub async fn peer_ready(&self, connection_id: &str, room: &RoomHandle) {
        let speaker = match room.current_speaker().await {
            Ok(speaker) => speaker,
            Err(_) => return, // room gone
        };
        let Some(speaker) = speaker else { return };
        let Some(producer_id) = speaker.producer_id else {
            return;
        };
        if speaker.connection_id == connection_id {
            return;
        }
        let _ = self
            .reconcile_one(room.room_id(), connection_id, &producer_id)
            .await;
    }

    /// Reconcile one peer against one producer. Returns `Break` when the
    /// producer no longer exists.
    async fn reconcile_one(
        &self,
        room_id: &str,
        connection_id: &str,
        producer_id: &str,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow::{Break, Continue};

        let Some(entry) = self.registry.entry(connection_id).await else {
            return Continue(());
        };

        // Fan-out eligibility follows channel membership, same as join.
        if !self.directory.is_member(room_id, &entry.device_id).await {
            debug!(
                target: "ptt.fanout",
                connection_id, room_id, "Peer not a channel member, skipping"
            );
            return Continue(());
        }

        // Snapshot under the lock; never await the engine while holding it.
        let (recv_transport_id, rtp_capabilities) = {
            let session = entry.session.lock().await;
            if session.consumers.contains_key(producer_id) {
                return Continue(()); // already reconciled
            }
            if session.room_id.as_deref() != Some(room_id) {
                return Continue(());
            }
            match (&session.recv_transport_id, &session.rtp_capabilities) {
                (Some(transport), Some(caps)) => (transport.clone(), caps.clone()),
                // Not ready yet; a later trigger picks this peer up.
                _ => return Continue(()),
            }
        };

        match self
            .create_consumer(&recv_transport_id, producer_id, &rtp_capabilities)
            .await
        {
            Ok(Some(parameters)) => {
                let event = ServerEvent::ConsumerCreated {
                    id: parameters.id.clone(),
                    producer_id: parameters.producer_id.clone(),
                    kind: parameters.kind.clone(),
                    rtp_parameters: parameters.rtp_parameters.clone(),
                    consumer_type: parameters.consumer_type.clone(),
                };

                // Re-check after the await: another trigger may have won,
                // or the peer may have left meanwhile.
                let stale = {
                    let mut session = entry.session.lock().await;
                    if session.room_id.as_deref() != Some(room_id)
                        || session.consumers.contains_key(producer_id)
                    {
                        true
                    } else {
                        session
                            .consumers
                            .insert(producer_id.to_string(), parameters.clone());
                        false
                    }
                };
                if stale {
                    let _ = self.engine.close_consumer(&parameters.id).await;
                    return Continue(());
                }

                debug!(
                    target: "ptt.fanout",
                    connection_id,
                    producer_id,
                    consumer_id = %parameters.id,
                    "Consumer created (paused)"
                );
                self.registry.send(connection_id, event).await;
                Continue(())
            }
            Ok(None) => Continue(()), // this target skipped
            Err(()) => Break(()),     // producer gone
        }
    }

    /// Create one paused consumer. `Ok(None)` skips the target,
    /// `Err(())` means the producer no longer exists.
    async fn create_consumer(
        &self,
        recv_transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<Option<crate::engine::ConsumerParameters>, ()> {
        match self.engine.can_consume(producer_id, rtp_capabilities).await {
            Ok(true) => {}
            Ok(false) | Err(EngineError::CapabilityMismatch(_)) => {
                debug!(target: "ptt.fanout", producer_id, "Capability mismatch, target skipped");
                return Ok(None);
            }
            Err(EngineError::UnknownProducer(_)) => return Err(()),
            Err(e) => {
                warn!(target: "ptt.fanout", producer_id, error = %e, "can_consume failed, target skipped");
                return Ok(None);
            }
        }

        match self
            .engine
            .consume(
                recv_transport_id,
                producer_id,
                rtp_capabilities.clone(),
            )
            .await
        {
            Ok(parameters) => Ok(Some(parameters)),
            Err(EngineError::UnknownProducer(_)) => Err(()),
            Err(EngineError::CapabilityMismatch(_)) => Ok(None),
            Err(EngineError::UnknownTransport(_)) => {
                // Peer tore its transport down mid-pass; skip quietly.
                Ok(None)
            }
            Err(e) => {
                warn!(target: "ptt.fanout", producer_id, error = %e, "consume failed, target skipped");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{CoordinatorMetrics, Member, RoomActor};
    use crate::engine::MemoryMediaEngine;
    use crate::signaling::TransportDirection;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Fixture {
        fanout: FanoutCoordinator,
        registry: Arc<PeerRegistry>,
        directory: Arc<DirectoryStore>,
        engine: Arc<MemoryMediaEngine>,
        channel_id: String,
        company_id: String,
    }

    async fn fixture() -> Fixture {
        let path = std::env::temp_dir().join(format!("ptt-fanout-{}.json", Uuid::new_v4()));
        let directory = Arc::new(DirectoryStore::open(path).await.unwrap());
        let company = directory.create_company("Acme").await.unwrap();
        let channel = directory.create_channel(&company.id, "ops").await.unwrap();

        let registry = Arc::new(PeerRegistry::new());
        let engine = Arc::new(MemoryMediaEngine::new());
        let fanout = FanoutCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
        );
        Fixture {
            fanout,
            registry,
            directory,
            engine,
            channel_id: channel.id,
            company_id: company.id,
        }
    }

    fn audio_caps() -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }] })
    }

    /// Register a member peer with a recv transport and caps already set.
    async fn ready_listener(
        fx: &Fixture,
        conn: &str,
    ) -> (String, UnboundedReceiver<ServerEvent>) {
        let device = fx
            .directory
            .create_device(&fx.company_id, conn, "pw")
            .await
            .unwrap();
        fx.directory
            .add_member(&fx.channel_id, &device.id)
            .await
            .unwrap();

        let (tx, rx) = unbounded_channel();
        let session = fx
            .registry
            .register(
                conn.to_string(),
                device.id.clone(),
                fx.company_id.clone(),
                conn.to_string(),
                tx,
            )
            .await;

        let transport = fx.engine.create_transport().await.unwrap();
        {
            let mut session = session.lock().await;
            session.room_id = Some(fx.channel_id.clone());
            session.record_transport(transport.id, TransportDirection::Recv);
            session.rtp_capabilities = Some(audio_caps());
        }
        (device.id, rx)
    }

    async fn live_producer(fx: &Fixture) -> String {
        let transport = fx.engine.create_transport().await.unwrap();
        fx.engine
            .produce(&transport.id, "audio", json!({}))
            .await
            .unwrap()
            .id
    }

    fn room_handle(fx: &Fixture) -> crate::actors::RoomHandle {
        let token = CancellationToken::new();
        let (handle, _task) =
            RoomActor::spawn(fx.channel_id.clone(), &token, CoordinatorMetrics::new());
        std::mem::forget(token);
        handle
    }

    #[tokio::test]
    async fn test_fanout_is_idempotent() {
        let fx = fixture().await;
        let (_dev, mut rx) = ready_listener(&fx, "listener").await;
        let producer_id = live_producer(&fx).await;
        let room = room_handle(&fx);

        let members = vec!["speaker".to_string(), "listener".to_string()];
        fx.fanout
            .producer_live(&room, "speaker", &producer_id, &members)
            .await;
        fx.fanout
            .producer_live(&room, "speaker", &producer_id, &members)
            .await;

        assert_eq!(fx.engine.consumers_of(&producer_id).await, 1);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ServerEvent::ConsumerCreated { .. }));
        assert!(rx.try_recv().is_err()); // no duplicate event
    }

    #[tokio::test]
    async fn test_unready_peer_is_picked_up_later() {
        let fx = fixture().await;
        let device = fx
            .directory
            .create_device(&fx.company_id, "late", "pw")
            .await
            .unwrap();
        fx.directory
            .add_member(&fx.channel_id, &device.id)
            .await
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let session = fx
            .registry
            .register(
                "late".to_string(),
                device.id,
                fx.company_id.clone(),
                "late".to_string(),
                tx,
            )
            .await;
        {
            let mut s = session.lock().await;
            s.room_id = Some(fx.channel_id.clone());
        }

        let producer_id = live_producer(&fx).await;
        let room = room_handle(&fx);
        let (speaker_member, _rx_s) = {
            let (tx, rx) = unbounded_channel();
            (
                Member {
                    connection_id: "speaker".to_string(),
                    device_id: "dev_speaker".to_string(),
                    display_name: "Speaker".to_string(),
                    outbound: tx,
                },
                rx,
            )
        };
        room.join(speaker_member).await.unwrap();
        room.request_speak("speaker".to_string()).await.unwrap();
        room.announce_producer("speaker".to_string(), producer_id.clone())
            .await
            .unwrap();

        // Not ready: no transport, no caps.
        fx.fanout
            .producer_live(
                &room,
                "speaker",
                &producer_id,
                &["speaker".to_string(), "late".to_string()],
            )
            .await;
        assert_eq!(fx.engine.consumers_of(&producer_id).await, 0);

        // Transport and caps arrive, then the ready trigger fires.
        let transport = fx.engine.create_transport().await.unwrap();
        {
            let mut s = session.lock().await;
            s.record_transport(transport.id, TransportDirection::Recv);
            s.rtp_capabilities = Some(audio_caps());
        }
        fx.fanout.peer_ready("late", &room).await;

        assert_eq!(fx.engine.consumers_of(&producer_id).await, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerEvent::ConsumerCreated { .. }
        ));
    }

    #[tokio::test]
    async fn test_capability_mismatch_skips_target_only() {
        let fx = fixture().await;
        let (_dev_ok, mut rx_ok) = ready_listener(&fx, "ok").await;

        // Second listener reports video-only capabilities.
        let device = fx
            .directory
            .create_device(&fx.company_id, "mismatch", "pw")
            .await
            .unwrap();
        fx.directory
            .add_member(&fx.channel_id, &device.id)
            .await
            .unwrap();
        let (tx, mut rx_bad) = unbounded_channel();
        let session = fx
            .registry
            .register(
                "mismatch".to_string(),
                device.id,
                fx.company_id.clone(),
                "mismatch".to_string(),
                tx,
            )
            .await;
        let transport = fx.engine.create_transport().await.unwrap();
        {
            let mut s = session.lock().await;
            s.room_id = Some(fx.channel_id.clone());
            s.record_transport(transport.id, TransportDirection::Recv);
            s.rtp_capabilities = Some(json!({ "codecs": [{ "mimeType": "video/VP8" }] }));
        }

        let producer_id = live_producer(&fx).await;
        let room = room_handle(&fx);
        fx.fanout
            .producer_live(
                &room,
                "speaker",
                &producer_id,
                &[
                    "speaker".to_string(),
                    "ok".to_string(),
                    "mismatch".to_string(),
                ],
            )
            .await;

        assert_eq!(fx.engine.consumers_of(&producer_id).await, 1);
        assert!(matches!(
            rx_ok.try_recv().unwrap(),
            ServerEvent::ConsumerCreated { .. }
        ));
        assert!(rx_bad.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_member_is_not_fanned_out() {
        let fx = fixture().await;
        // Registered peer, ready to consume, but no membership edge.
        let device = fx
            .directory
            .create_device(&fx.company_id, "outsider", "pw")
            .await
            .unwrap();
        let (tx, mut rx) = unbounded_channel();
        let session = fx
            .registry
            .register(
                "outsider".to_string(),
                device.id,
                fx.company_id.clone(),
                "outsider".to_string(),
                tx,
            )
            .await;
        let transport = fx.engine.create_transport().await.unwrap();
        {
            let mut s = session.lock().await;
            s.room_id = Some(fx.channel_id.clone());
            s.record_transport(transport.id, TransportDirection::Recv);
            s.rtp_capabilities = Some(audio_caps());
        }

        let producer_id = live_producer(&fx).await;
        let room = room_handle(&fx);
        fx.fanout
            .producer_live(
                &room,
                "speaker",
                &producer_id,
                &["speaker".to_string(), "outsider".to_string()],
            )
            .await;

        assert_eq!(fx.engine.consumers_of(&producer_id).await, 0);
        assert!(rx.try_recv().is_err());
    }
}
