//! Signaling protocol: the WebSocket wire format.
//!
//! Every frame is a JSON envelope `{"type": "...", "data": {...}}`. Field
//! names are camelCase on the wire. RTP capability and parameter payloads
//! are opaque [`Value`]s passed through to the media engine untouched.

pub mod handler;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport direction, chosen by the client at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Messages a client sends over the signaling socket.
///
/// The first frame on every socket must be `auth:connect`; anything else is
/// rejected until authentication completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Present a session token. Must be the first frame.
    #[serde(rename = "auth:connect")]
    AuthConnect { token: String },

    /// Join a channel's room. Membership is checked against the directory.
    #[serde(rename = "join-room")]
    JoinRoom {
        room_id: String,
        /// Optional display-name override for this session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    /// Ask for the floor in the current room.
    #[serde(rename = "request-speak")]
    RequestSpeak,

    /// Yield the floor.
    #[serde(rename = "stop-speaking")]
    StopSpeaking,

    /// Create a WebRTC transport in the given direction.
    #[serde(rename = "create-transport")]
    CreateTransport { direction: TransportDirection },

    /// Finish the DTLS handshake for a previously created transport.
    #[serde(rename = "connect-transport")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },

    /// Publish the microphone stream. Only the current speaker may produce.
    #[serde(rename = "produce-audio")]
    ProduceAudio {
        transport_id: String,
        kind: String,
        rtp_parameters: Value,
    },

    /// Record the client's receive capabilities; triggers reconciliation.
    #[serde(rename = "client-rtp-caps")]
    ClientRtpCaps { rtp_capabilities: Value },

    /// Explicitly request a consumer for a producer (idempotent).
    #[serde(rename = "consume-audio")]
    ConsumeAudio { producer_id: String },

    /// Unmute: resume every consumer this peer holds.
    #[serde(rename = "resume-consumer")]
    ResumeConsumer,

    /// Mute: pause every consumer this peer holds.
    #[serde(rename = "pause-consumer")]
    PauseConsumer,

    /// Leave the current room. Media is released; the socket stays up.
    #[serde(rename = "leave-room")]
    LeaveRoom,

    /// Page channel members, joined to the room or not. With a target
    /// device id the page goes to that device's connections only.
    #[serde(rename = "page")]
    Page {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_device_id: Option<String>,
    },
}

/// Events the coordinator pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "auth:ok")]
    AuthOk { device_id: String, name: String },

    #[serde(rename = "auth:error")]
    AuthError { error: String },

    #[serde(rename = "join-success")]
    JoinSuccess {
        room_id: String,
        user_id: String,
        room_size: usize,
    },

    #[serde(rename = "join-error")]
    JoinError { error: String },

    /// Unicast to the joining peer so it can negotiate codecs.
    #[serde(rename = "rtp-capabilities")]
    RtpCapabilities { rtp_capabilities: Value },

    #[serde(rename = "user-joined")]
    UserJoined {
        user_id: String,
        user_name: String,
        total_users: usize,
    },

    #[serde(rename = "user-left")]
    UserLeft { user_id: String, total_users: usize },

    /// The floor is yours.
    #[serde(rename = "speak-granted")]
    SpeakGranted,

    /// Somebody else holds the floor.
    #[serde(rename = "channel-busy")]
    ChannelBusy {
        current_speaker: String,
        speaker_id: String,
    },

    #[serde(rename = "speak-error")]
    SpeakError { error: String },

    #[serde(rename = "user-speaking")]
    UserSpeaking { user_id: String, user_name: String },

    #[serde(rename = "user-stopped")]
    UserStopped { user_id: String },

    #[serde(rename = "transport-created")]
    TransportCreated {
        direction: TransportDirection,
        id: String,
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
    },

    /// Acknowledges `produce-audio` with the engine-assigned producer id.
    #[serde(rename = "producer-ok")]
    ProducerOk { id: String },

    /// A new producer is live in the room; consumers follow.
    #[serde(rename = "new-producer")]
    NewProducer { producer_id: String, user_id: String },

    /// A consumer was created (paused) for this peer.
    #[serde(rename = "consumer-created")]
    ConsumerCreated {
        id: String,
        producer_id: String,
        kind: String,
        rtp_parameters: Value,
        #[serde(rename = "type")]
        consumer_type: String,
    },

    /// A member paged the channel.
    #[serde(rename = "page")]
    Page {
        room_id: String,
        from_user_id: String,
        from_name: String,
    },

    /// Catch-all error for malformed or out-of-place frames.
    #[serde(rename = "error")]
    Error { error: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_envelope_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "join-room",
            "data": { "roomId": "ch_1" }
        }))
        .unwrap();
        assert!(
            matches!(msg, ClientMessage::JoinRoom { ref room_id, ref user_name }
                if room_id == "ch_1" && user_name.is_none())
        );

        // Unit variants need no data field.
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "stop-speaking" })).unwrap();
        assert!(matches!(msg, ClientMessage::StopSpeaking));
    }

    #[test]
    fn test_fields_are_camel_case_on_the_wire() {
        let event = ServerEvent::ChannelBusy {
            current_speaker: "Dispatch".to_string(),
            speaker_id: "conn_1".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "channel-busy");
        assert_eq!(value["data"]["currentSpeaker"], "Dispatch");
        assert_eq!(value["data"]["speakerId"], "conn_1");
    }

    #[test]
    fn test_consumer_created_uses_type_field() {
        let event = ServerEvent::ConsumerCreated {
            id: "c1".to_string(),
            producer_id: "p1".to_string(),
            kind: "audio".to_string(),
            rtp_parameters: json!({}),
            consumer_type: "simple".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["producerId"], "p1");
        assert_eq!(value["data"]["type"], "simple");
    }

    #[test]
    fn test_transport_direction_round_trip() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "create-transport",
            "data": { "direction": "recv" }
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::CreateTransport {
                direction: TransportDirection::Recv
            }
        ));
    }

    #[test]
    fn test_consumer_controls_take_no_payload() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "resume-consumer" })).unwrap();
        assert!(matches!(msg, ClientMessage::ResumeConsumer));

        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "pause-consumer" })).unwrap();
        assert!(matches!(msg, ClientMessage::PauseConsumer));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_value(json!({ "type": "warp-speed", "data": {} }));
        assert!(result.is_err());
    }
}
