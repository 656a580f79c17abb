//! Per-connection signaling handler.
//!
//! One [`Connection`] per WebSocket, driven by the socket task in
//! `server.rs`. The handler owns the connection's lifecycle: authentication
//! first, then room membership, floor requests and media plumbing. All
//! outcomes are pushed onto the connection's outbound queue; the socket
//! writer drains it.
//!
//! Integration tests drive this type directly, without a socket.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::actors::{Member, RoomHandle};
use crate::errors::CoordinatorError;
use crate::session::OutboundSender;
use crate::signaling::{ClientMessage, ServerEvent, TransportDirection};
use crate::AppState;

/// Authenticated identity, fixed for the connection's lifetime.
#[derive(Debug, Clone)]
struct Identity {
    device_id: String,
    company_id: String,
    display_name: String,
}

/// State machine for one signaling connection.
pub struct Connection {
    state: AppState,
    connection_id: String,
    outbound: OutboundSender,
    identity: Option<Identity>,
    room: Option<RoomHandle>,
}

impl Connection {
    #[must_use]
    pub fn new(state: AppState, outbound: OutboundSender) -> Self {
        Self {
            state,
            connection_id: Uuid::new_v4().to_string(),
            outbound,
            identity: None,
            room: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn send(&self, event: ServerEvent) {
        let _ = self.outbound.send(event);
    }

    /// Handle one parsed client frame.
    #[instrument(skip_all, fields(connection_id = %self.connection_id))]
    pub async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::AuthConnect { token } => self.on_auth(token).await,
            other if self.identity.is_none() => {
                debug!(target: "ptt.signaling", ?other, "Frame before auth, rejected");
                self.send(ServerEvent::AuthError {
                    error: "Authenticate first".to_string(),
                });
            }
            ClientMessage::JoinRoom { room_id, user_name } => {
                self.on_join(room_id, user_name).await;
            }
            ClientMessage::RequestSpeak => self.on_request_speak().await,
            ClientMessage::StopSpeaking => self.on_stop_speaking().await,
            ClientMessage::CreateTransport { direction } => {
                self.on_create_transport(direction).await;
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                if let Err(e) = self
                    .state
                    .media
                    .connect_transport(&self.connection_id, &transport_id, dtls_parameters)
                    .await
                {
                    self.send_error(&e);
                }
            }
            ClientMessage::ProduceAudio {
                transport_id,
                kind,
                rtp_parameters,
            } => self.on_produce(transport_id, kind, rtp_parameters).await,
            ClientMessage::ClientRtpCaps { rtp_capabilities } => {
                if let Err(e) = self
                    .state
                    .media
                    .record_capabilities(&self.connection_id, rtp_capabilities)
                    .await
                {
                    self.send_error(&e);
                    return;
                }
                self.reconcile().await;
            }
            ClientMessage::ConsumeAudio { producer_id } => self.on_consume(producer_id).await,
            ClientMessage::ResumeConsumer => {
                self.state.media.resume_all(&self.connection_id).await;
            }
            ClientMessage::PauseConsumer => {
                self.state.media.pause_all(&self.connection_id).await;
            }
            ClientMessage::LeaveRoom => self.leave_current_room().await,
            ClientMessage::Page {
                room_id,
                to_device_id,
            } => self.on_page(room_id, to_device_id).await,
        }
    }

    /// Socket closed: leave the room and drop every engine resource.
    pub async fn on_disconnect(&mut self) {
        self.leave_current_room().await;
        self.state
            .registry
            .remove(&self.connection_id, self.state.engine.as_ref())
            .await;
        if self.identity.is_some() {
            info!(
                target: "ptt.signaling",
                connection_id = %self.connection_id,
                "Connection closed"
            );
        }
    }

    async fn on_auth(&mut self, token: String) {
        if self.identity.is_some() {
            self.send(ServerEvent::AuthError {
                error: "Already authenticated".to_string(),
            });
            return;
        }
        let claims = match self.state.tokens.verify(&token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(target: "ptt.signaling", error = %e, "Token rejected");
                self.send(ServerEvent::AuthError {
                    error: e.client_message(),
                });
                return;
            }
        };

        let identity = Identity {
            device_id: claims.sub,
            company_id: claims.company_id,
            display_name: claims.name,
        };
        self.state
            .registry
            .register(
                self.connection_id.clone(),
                identity.device_id.clone(),
                identity.company_id.clone(),
                identity.display_name.clone(),
                self.outbound.clone(),
            )
            .await;
        info!(
            target: "ptt.signaling",
            connection_id = %self.connection_id,
            device_id = %identity.device_id,
            "Authenticated"
        );
        self.send(ServerEvent::AuthOk {
            device_id: identity.device_id.clone(),
            name: identity.display_name.clone(),
        });
        self.identity = Some(identity);
    }

    async fn on_join(&mut self, room_id: String, user_name: Option<String>) {
        let Some(identity) = self.identity.clone() else {
            return;
        };

        // One room at a time: joining while joined leaves the old room.
        if self.room.is_some() {
            self.leave_current_room().await;
        }

        // Authorization happens here, outside the actors: the channel must
        // exist, belong to the device's company, and list the device.
        let Some(channel) = self.state.directory.channel(&room_id).await else {
            self.send(ServerEvent::JoinError {
                error: "Channel not found".to_string(),
            });
            return;
        };
        if channel.company_id != identity.company_id {
            self.send(ServerEvent::JoinError {
                error: "Not authorized for this channel".to_string(),
            });
            return;
        }
        if !self
            .state
            .directory
            .is_member(&room_id, &identity.device_id)
            .await
        {
            self.send(ServerEvent::JoinError {
                error: "Not a member of this channel".to_string(),
            });
            return;
        }

        let display_name = user_name.unwrap_or_else(|| identity.display_name.clone());
        let member = Member {
            connection_id: self.connection_id.clone(),
            device_id: identity.device_id.clone(),
            display_name: display_name.clone(),
            outbound: self.outbound.clone(),
        };

        let (room, snapshot) = match self
            .state
            .coordinator
            .join_room(room_id.clone(), member)
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                self.send(ServerEvent::JoinError {
                    error: e.client_message(),
                });
                return;
            }
        };

        if let Some(session) = self.state.registry.session(&self.connection_id).await {
            let mut session = session.lock().await;
            session.room_id = Some(room_id.clone());
            session.display_name = display_name;
        }
        self.room = Some(room);

        self.send(ServerEvent::JoinSuccess {
            room_id,
            user_id: identity.device_id,
            room_size: snapshot.room_size,
        });

        // Unicast router capabilities so the client can negotiate codecs.
        match self.state.media.router_capabilities().await {
            Ok(rtp_capabilities) => self.send(ServerEvent::RtpCapabilities { rtp_capabilities }),
            Err(e) => {
                warn!(target: "ptt.signaling", error = %e, "Router capabilities unavailable");
                self.send_error(&e);
            }
        }

        // Late joiner: tell them who is talking right now, and about the
        // active producer so their consumer gets reconciled once ready.
        if let Some(speaker) = snapshot.speaker {
            if let Some(producer_id) = speaker.producer_id.clone() {
                self.send(ServerEvent::NewProducer {
                    producer_id,
                    user_id: speaker.device_id.clone(),
                });
            }
            self.send(ServerEvent::UserSpeaking {
                user_id: speaker.device_id,
                user_name: speaker.display_name,
            });
        }
    }

    async fn on_request_speak(&mut self) {
        let Some(room) = &self.room else {
            self.send(ServerEvent::SpeakError {
                error: "Not in a room".to_string(),
            });
            return;
        };
        if let Err(e) = room.request_speak(self.connection_id.clone()).await {
            self.send(ServerEvent::SpeakError {
                error: e.client_message(),
            });
        }
    }

    async fn on_stop_speaking(&mut self) {
        let Some(room) = self.room.clone() else {
            return; // not in a room: silently ignored
        };
        match room.stop_speaking(self.connection_id.clone()).await {
            Ok(Some(producer_id)) => {
                self.state
                    .media
                    .close_producer(&self.connection_id, &producer_id)
                    .await;
            }
            Ok(None) => {} // was not speaking, or no producer yet
            Err(e) => self.send_error(&e),
        }
    }

    async fn on_create_transport(&mut self, direction: TransportDirection) {
        match self
            .state
            .media
            .create_transport(&self.connection_id, direction)
            .await
        {
            Ok(parameters) => {
                self.send(ServerEvent::TransportCreated {
                    direction,
                    id: parameters.id,
                    ice_parameters: parameters.ice_parameters,
                    ice_candidates: parameters.ice_candidates,
                    dtls_parameters: parameters.dtls_parameters,
                });
                // A fresh recv transport may complete readiness.
                if direction == TransportDirection::Recv {
                    self.reconcile().await;
                }
            }
            Err(e) => self.send_error(&e),
        }
    }

    async fn on_produce(
        &mut self,
        transport_id: String,
        kind: String,
        rtp_parameters: serde_json::Value,
    ) {
        let Some(room) = self.room.clone() else {
            self.send(ServerEvent::SpeakError {
                error: "Not in a room".to_string(),
            });
            return;
        };

        // Only the floor holder may produce; no producer is created on
        // denial.
        let holds_floor = matches!(
            room.current_speaker().await,
            Ok(Some(speaker)) if speaker.connection_id == self.connection_id
        );
        if !holds_floor {
            self.send(ServerEvent::SpeakError {
                error: CoordinatorError::NotSpeaker.client_message(),
            });
            return;
        }

        let created = match self
            .state
            .media
            .produce(&self.connection_id, &transport_id, &kind, rtp_parameters)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.send_error(&e);
                return;
            }
        };
        self.send(ServerEvent::ProducerOk {
            id: created.id.clone(),
        });

        match room
            .announce_producer(self.connection_id.clone(), created.id.clone())
            .await
        {
            Ok(Some(members)) => {
                self.state
                    .fanout
                    .producer_live(&room, &self.connection_id, &created.id, &members)
                    .await;
            }
            Ok(None) => {
                // Floor lost between the check and the announce.
                self.state
                    .media
                    .close_producer(&self.connection_id, &created.id)
                    .await;
                self.send(ServerEvent::SpeakError {
                    error: CoordinatorError::NotSpeaker.client_message(),
                });
            }
            Err(e) => self.send_error(&e),
        }
    }

    /// Explicit consume: a consumer already recorded for this producer is
    /// replayed rather than re-created; otherwise this is one more
    /// reconcile trigger, and a stale producer id is ignored.
    async fn on_consume(&mut self, producer_id: String) {
        if let Some(session) = self.state.registry.session(&self.connection_id).await {
            let existing = session.lock().await.consumers.get(&producer_id).cloned();
            if let Some(parameters) = existing {
                debug!(target: "ptt.signaling", %producer_id, "Replaying existing consumer");
                self.send(ServerEvent::ConsumerCreated {
                    id: parameters.id,
                    producer_id: parameters.producer_id,
                    kind: parameters.kind,
                    rtp_parameters: parameters.rtp_parameters,
                    consumer_type: parameters.consumer_type,
                });
                return;
            }
        }
        self.reconcile().await;
    }

    /// Run a fan-out reconcile for this peer against its room.
    async fn reconcile(&self) {
        if let Some(room) = &self.room {
            self.state.fanout.peer_ready(&self.connection_id, room).await;
        }
    }

    async fn on_page(&mut self, room_id: String, to_device_id: Option<String>) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if !self
            .state
            .directory
            .is_member(&room_id, &identity.device_id)
            .await
        {
            self.send(ServerEvent::Error {
                error: "Not a member of this channel".to_string(),
            });
            return;
        }

        let members = self.state.directory.members_of(&room_id).await;
        let event = ServerEvent::Page {
            room_id,
            from_user_id: identity.device_id.clone(),
            from_name: identity.display_name.clone(),
        };

        // Targeted page goes to one member device's connections; otherwise
        // every online member device gets it, joined to the room or not.
        let targets = match to_device_id {
            Some(device_id) if members.contains(&device_id) => {
                self.state.registry.connections_of_device(&device_id).await
            }
            Some(_) => {
                self.send(ServerEvent::Error {
                    error: "Target is not a member of this channel".to_string(),
                });
                return;
            }
            None => self.state.registry.all_entries().await,
        };

        let mut notified = 0usize;
        for (connection_id, entry) in targets {
            if connection_id == self.connection_id || !members.contains(&entry.device_id) {
                continue;
            }
            let _ = entry.outbound.send(event.clone());
            notified += 1;
        }
        self.state.metrics.page_sent();
        debug!(target: "ptt.signaling", notified, "Page delivered");
    }

    async fn leave_current_room(&mut self) {
        let Some(room) = self.room.take() else { return };
        let room_id = room.room_id().to_string();

        match self
            .state
            .coordinator
            .leave_room(room_id.clone(), self.connection_id.clone())
            .await
        {
            Ok(reply) => {
                if let Some(producer_id) = reply.producer_id {
                    // Leaver held the floor; their producer dies with them.
                    self.state
                        .media
                        .close_producer(&self.connection_id, &producer_id)
                        .await;
                }
            }
            Err(CoordinatorError::RoomNotFound(_)) => {} // already destroyed
            Err(e) => warn!(
                target: "ptt.signaling",
                connection_id = %self.connection_id,
                error = %e,
                "Leave failed"
            ),
        }

        // Media is torn down on leave; the socket stays up for paging.
        self.state
            .registry
            .release_media(&self.connection_id, self.state.engine.as_ref())
            .await;
        debug!(
            target: "ptt.signaling",
            connection_id = %self.connection_id,
            room_id,
            "Left room"
        );
    }

    fn send_error(&self, error: &CoordinatorError) {
        self.send(ServerEvent::Error {
            error: error.client_message(),
        });
    }
}
