//! `CoordinatorActor` - singleton that owns the room registry.
//!
//! The coordinator creates rooms on first join, routes joins and leaves,
//! and destroys rooms when the last member leaves. Room actors run under a
//! child token of the coordinator's, so cancelling the coordinator tears
//! down every room.
//!
//! A periodic health check reaps rooms whose actor task has finished
//! unexpectedly, so a crashed room never leaves a dangling handle behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::metrics::CoordinatorMetrics;
use super::room::{JoinSnapshot, LeaveReply, Member, RoomActor, RoomHandle};
use crate::errors::CoordinatorError;

/// Mailbox buffer for the coordinator.
const COORDINATOR_CHANNEL_BUFFER: usize = 500;

/// How often finished room tasks are reaped.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

enum CoordinatorMessage {
    JoinRoom {
        room_id: String,
        member: Member,
        respond_to: oneshot::Sender<Result<(RoomHandle, JoinSnapshot), CoordinatorError>>,
    },
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },
    LeaveRoom {
        room_id: String,
        connection_id: String,
        respond_to: oneshot::Sender<Result<LeaveReply, CoordinatorError>>,
    },
    RoomCount {
        respond_to: oneshot::Sender<usize>,
    },
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomHandle>>,
    },
    BeginDrain,
}

/// Handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl CoordinatorHandle {
    async fn send(&self, message: CoordinatorMessage) -> Result<(), CoordinatorError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))
    }

    /// Join a room, creating it on first join. Rejected while draining.
    pub async fn join_room(
        &self,
        room_id: String,
        member: Member,
    ) -> Result<(RoomHandle, JoinSnapshot), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::JoinRoom {
            room_id,
            member,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))?
    }

    pub async fn room(&self, room_id: String) -> Result<Option<RoomHandle>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetRoom {
            room_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))
    }

    /// Leave a room; the room is destroyed when it empties.
    pub async fn leave_room(
        &self,
        room_id: String,
        connection_id: String,
    ) -> Result<LeaveReply, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::LeaveRoom {
            room_id,
            connection_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))?
    }

    pub async fn room_count(&self) -> Result<usize, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::RoomCount { respond_to: tx })
            .await?;
        rx.await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))
    }

    /// Handles to every live room (presence reporting).
    pub async fn rooms(&self) -> Result<Vec<RoomHandle>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::ListRooms { respond_to: tx })
            .await?;
        rx.await
            .map_err(|_| CoordinatorError::Internal("coordinator actor gone".to_string()))
    }

    /// Stop accepting joins; existing rooms keep running until shutdown.
    pub async fn begin_drain(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::BeginDrain).await
    }

    /// Cancel the coordinator and every room under it.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

struct RoomEntry {
    handle: RoomHandle,
    task: JoinHandle<()>,
}

/// Singleton coordinator actor.
pub struct CoordinatorActor {
    rooms: HashMap<String, RoomEntry>,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<CoordinatorMetrics>,
    draining: bool,
}

impl CoordinatorActor {
    /// Spawn the coordinator under the given root token.
    pub fn spawn(
        root_token: &CancellationToken,
        metrics: Arc<CoordinatorMetrics>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel_token = root_token.child_token();

        let actor = CoordinatorActor {
            rooms: HashMap::new(),
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            draining: false,
        };
        let handle = CoordinatorHandle {
            sender,
            cancel_token,
        };
        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!(target: "ptt.coordinator", "Coordinator actor started");
        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "ptt.coordinator", rooms = self.rooms.len(), "Coordinator cancelled, stopping rooms");
                    break;
                }
                _ = health_check.tick() => {
                    self.reap_finished_rooms();
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        for (room_id, entry) in self.rooms.drain() {
            entry.handle.cancel();
            debug!(target: "ptt.coordinator", room_id = %room_id, "Room cancelled on shutdown");
        }
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::JoinRoom {
                room_id,
                member,
                respond_to,
            } => {
                if self.draining {
                    let _ = respond_to.send(Err(CoordinatorError::Draining));
                    return;
                }

                let entry = self.rooms.entry(room_id.clone()).or_insert_with(|| {
                    info!(target: "ptt.coordinator", room_id = %room_id, "Room created");
                    self.metrics.room_created();
                    let (handle, task) = RoomActor::spawn(
                        room_id.clone(),
                        &self.cancel_token,
                        Arc::clone(&self.metrics),
                    );
                    RoomEntry { handle, task }
                });

                let handle = entry.handle.clone();
                let result = handle
                    .join(member)
                    .await
                    .map(|snapshot| (handle.clone(), snapshot));
                let _ = respond_to.send(result);
            }
            CoordinatorMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let handle = self.rooms.get(&room_id).map(|e| e.handle.clone());
                let _ = respond_to.send(handle);
            }
            CoordinatorMessage::LeaveRoom {
                room_id,
                connection_id,
                respond_to,
            } => {
                let Some(entry) = self.rooms.get(&room_id) else {
                    let _ = respond_to.send(Err(CoordinatorError::RoomNotFound(room_id)));
                    return;
                };

                let result = entry.handle.leave(connection_id).await;
                if let Ok(reply) = &result {
                    if reply.remaining == 0 {
                        self.destroy_room(&room_id);
                    }
                }
                let _ = respond_to.send(result);
            }
            CoordinatorMessage::RoomCount { respond_to } => {
                let _ = respond_to.send(self.rooms.len());
            }
            CoordinatorMessage::ListRooms { respond_to } => {
                let handles = self.rooms.values().map(|e| e.handle.clone()).collect();
                let _ = respond_to.send(handles);
            }
            CoordinatorMessage::BeginDrain => {
                info!(target: "ptt.coordinator", "Draining: rejecting new joins");
                self.draining = true;
            }
        }
    }

    fn destroy_room(&mut self, room_id: &str) {
        if let Some(entry) = self.rooms.remove(room_id) {
            entry.handle.cancel();
            self.metrics.room_destroyed();
            info!(target: "ptt.coordinator", room_id = %room_id, "Room destroyed (empty)");
        }
    }

    /// Drop entries whose actor task already finished (panic or bug); the
    /// next join recreates the room cleanly.
    fn reap_finished_rooms(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, entry)| entry.task.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            error!(target: "ptt.coordinator", room_id = %room_id, "Room actor finished unexpectedly, reaping");
            if self.rooms.remove(&room_id).is_some() {
                self.metrics.room_destroyed();
            }
        }
        if !self.rooms.is_empty() {
            debug!(target: "ptt.coordinator", rooms = self.rooms.len(), "Health check complete");
        }
    }
}
