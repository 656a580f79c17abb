//! In-memory media engine.
//!
//! Deterministic stand-in for the SFU, used by tests and by local
//! development when no sidecar URL is configured. Resources are plain maps;
//! consume eligibility checks that the receiver's capability descriptor
//! carries at least one audio codec.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConsumerParameters, EngineError, MediaEngine, ProducerCreated, TransportParameters};

#[derive(Debug, Clone)]
struct Transport {
    connected: bool,
}

#[derive(Debug, Clone)]
struct Producer {
    kind: String,
    rtp_parameters: Value,
}

#[derive(Debug, Clone)]
struct Consumer {
    producer_id: String,
    paused: bool,
}

#[derive(Debug, Default)]
struct State {
    transports: HashMap<String, Transport>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

/// In-memory [`MediaEngine`] implementation.
#[derive(Debug, Default)]
pub struct MemoryMediaEngine {
    state: Mutex<State>,
}

impl MemoryMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the consumer is currently paused. Test observation hook.
    pub async fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state
            .lock()
            .await
            .consumers
            .get(consumer_id)
            .map(|c| c.paused)
    }

    /// Number of live consumers for the given producer. Test observation hook.
    pub async fn consumers_of(&self, producer_id: &str) -> usize {
        self.state
            .lock()
            .await
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .count()
    }

    /// Whether the producer still exists. Test observation hook.
    pub async fn producer_exists(&self, producer_id: &str) -> bool {
        self.state.lock().await.producers.contains_key(producer_id)
    }

    /// Whether the transport still exists. Test observation hook.
    pub async fn transport_exists(&self, transport_id: &str) -> bool {
        self.state
            .lock()
            .await
            .transports
            .contains_key(transport_id)
    }

    /// Whether the transport completed its DTLS connect. Test observation
    /// hook.
    pub async fn transport_connected(&self, transport_id: &str) -> Option<bool> {
        self.state
            .lock()
            .await
            .transports
            .get(transport_id)
            .map(|t| t.connected)
    }

    fn caps_carry_audio(rtp_capabilities: &Value) -> bool {
        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|codec| {
                    codec
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .is_some_and(|mime| mime.starts_with("audio/"))
                })
            })
    }
}

#[async_trait]
impl MediaEngine for MemoryMediaEngine {
    async fn router_capabilities(&self) -> Result<Value, EngineError> {
        Ok(json!({
            "codecs": [{
                "kind": "audio",
                "mimeType": "audio/opus",
                "clockRate": 48000,
                "channels": 2,
                "parameters": {
                    "useinbandfec": 1,
                    "usedtx": 1
                }
            }]
        }))
    }

    async fn create_transport(&self) -> Result<TransportParameters, EngineError> {
        let id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .await
            .transports
            .insert(id.clone(), Transport { connected: false });

        Ok(TransportParameters {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match state.transports.get_mut(transport_id) {
            Some(transport) => {
                transport.connected = true;
                Ok(())
            }
            None => Err(EngineError::UnknownTransport(transport_id.to_string())),
        }
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> Result<ProducerCreated, EngineError> {
        let mut state = self.state.lock().await;
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::UnknownTransport(transport_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            Producer {
                kind: kind.to_string(),
                rtp_parameters,
            },
        );
        Ok(ProducerCreated {
            id,
            kind: kind.to_string(),
        })
    }

    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        if !state.producers.contains_key(producer_id) {
            return Err(EngineError::UnknownProducer(producer_id.to_string()));
        }
        Ok(Self::caps_carry_audio(rtp_capabilities))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParameters, EngineError> {
        let mut state = self.state.lock().await;
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::UnknownTransport(transport_id.to_string()));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.to_string()))?;
        if !Self::caps_carry_audio(&rtp_capabilities) {
            return Err(EngineError::CapabilityMismatch(producer_id.to_string()));
        }

        let parameters = ConsumerParameters {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind.clone(),
            rtp_parameters: producer.rtp_parameters.clone(),
            consumer_type: "simple".to_string(),
        };
        state.consumers.insert(
            parameters.id.clone(),
            Consumer {
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );
        Ok(parameters)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match state.consumers.get_mut(consumer_id) {
            Some(consumer) => {
                consumer.paused = true;
                Ok(())
            }
            None => Err(EngineError::UnknownConsumer(consumer_id.to_string())),
        }
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match state.consumers.get_mut(consumer_id) {
            Some(consumer) => {
                consumer.paused = false;
                Ok(())
            }
            None => Err(EngineError::UnknownConsumer(consumer_id.to_string())),
        }
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.state.lock().await.transports.remove(transport_id);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.producers.remove(producer_id);
        state
            .consumers
            .retain(|_, consumer| consumer.producer_id != producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.state.lock().await.consumers.remove(consumer_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn audio_caps() -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }] })
    }

    #[tokio::test]
    async fn test_consume_starts_paused() {
        let engine = MemoryMediaEngine::new();
        let send = engine.create_transport().await.unwrap();
        let recv = engine.create_transport().await.unwrap();
        let producer = engine
            .produce(&send.id, "audio", json!({ "codecs": [] }))
            .await
            .unwrap();

        let consumer = engine
            .consume(&recv.id, &producer.id, audio_caps())
            .await
            .unwrap();

        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(engine.consumer_paused(&consumer.id).await, Some(true));

        engine.resume_consumer(&consumer.id).await.unwrap();
        assert_eq!(engine.consumer_paused(&consumer.id).await, Some(false));
    }

    #[tokio::test]
    async fn test_consume_rejects_non_audio_capabilities() {
        let engine = MemoryMediaEngine::new();
        let send = engine.create_transport().await.unwrap();
        let recv = engine.create_transport().await.unwrap();
        let producer = engine
            .produce(&send.id, "audio", json!({}))
            .await
            .unwrap();

        let video_only = json!({ "codecs": [{ "mimeType": "video/VP8" }] });
        assert!(!engine.can_consume(&producer.id, &video_only).await.unwrap());
        assert!(matches!(
            engine.consume(&recv.id, &producer.id, video_only).await,
            Err(EngineError::CapabilityMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_resources() {
        let engine = MemoryMediaEngine::new();

        assert!(matches!(
            engine.connect_transport("nope", json!({})).await,
            Err(EngineError::UnknownTransport(_))
        ));
        assert_eq!(engine.transport_connected("nope").await, None);
        assert!(matches!(
            engine.produce("nope", "audio", json!({})).await,
            Err(EngineError::UnknownTransport(_))
        ));
        assert!(matches!(
            engine.can_consume("nope", &audio_caps()).await,
            Err(EngineError::UnknownProducer(_))
        ));
        assert!(matches!(
            engine.resume_consumer("nope").await,
            Err(EngineError::UnknownConsumer(_))
        ));

        // Close is idempotent.
        assert!(engine.close_transport("nope").await.is_ok());
        assert!(engine.close_producer("nope").await.is_ok());
        assert!(engine.close_consumer("nope").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_producer_drops_its_consumers() {
        let engine = MemoryMediaEngine::new();
        let send = engine.create_transport().await.unwrap();
        let recv = engine.create_transport().await.unwrap();
        let producer = engine.produce(&send.id, "audio", json!({})).await.unwrap();
        let consumer = engine
            .consume(&recv.id, &producer.id, audio_caps())
            .await
            .unwrap();

        engine.close_producer(&producer.id).await.unwrap();
        assert!(!engine.producer_exists(&producer.id).await);
        assert_eq!(engine.consumer_paused(&consumer.id).await, None);
    }
}
