//! Media engine (SFU) boundary.
//!
//! The engine terminates ICE/DTLS/RTP and exposes router, transport,
//! producer and consumer primitives; it makes no policy decisions. The
//! coordinator talks to it through the [`MediaEngine`] trait and only adds
//! bookkeeping on top.
//!
//! RTP capabilities, ICE/DTLS material and RTP parameters are opaque JSON
//! descriptors negotiated between the client and the engine; the coordinator
//! forwards them without interpretation.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpMediaEngine;
pub use memory::MemoryMediaEngine;

/// Media engine call failures.
///
/// `Unknown*` variants are expected during teardown races and are treated
/// as already-cleaned-up by callers; they are never surfaced to clients.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Receiver capabilities cannot decode the target producer.
    #[error("capability mismatch for producer {0}")]
    CapabilityMismatch(String),

    /// Transport-level failure reaching the engine.
    #[error("engine unreachable: {0}")]
    Transport(String),

    /// Engine answered with something the adapter cannot interpret.
    #[error("engine protocol error: {0}")]
    Protocol(String),
}

/// ICE/DTLS connection material for a newly created transport, forwarded
/// verbatim to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// A producer created from an inbound RTP stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerCreated {
    pub id: String,
    pub kind: String,
}

/// A consumer created against a producer, in the paused state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParameters {
    pub id: String,
    pub producer_id: String,
    pub kind: String,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
}

/// Capability boundary to the external media routing engine.
///
/// Every call is a suspension point; callers must re-check their own state
/// after awaiting (the owning peer may have disconnected meanwhile).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router capability descriptor, needed by clients to negotiate codecs.
    async fn router_capabilities(&self) -> Result<Value, EngineError>;

    /// Create a new transport and return its ICE/DTLS material.
    async fn create_transport(&self) -> Result<TransportParameters, EngineError>;

    /// Complete the DTLS handshake for a transport.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError>;

    /// Create a producer from an inbound RTP stream on the given transport.
    async fn produce(
        &self,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> Result<ProducerCreated, EngineError>;

    /// Whether the given receive capabilities can decode the producer.
    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError>;

    /// Create a consumer against a producer, in the paused state.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParameters, EngineError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Close calls are idempotent: closing an already-gone resource is Ok.
    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;
}
