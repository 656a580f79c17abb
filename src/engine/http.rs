//! HTTP client adapter for an SFU sidecar.
//!
//! The sidecar owns the media plane and exposes router/transport/producer/
//! consumer primitives over a JSON API:
//!
//! ```text
//! GET    /router/rtp-capabilities
//! POST   /transports
//! POST   /transports/:id/connect        {dtlsParameters}
//! POST   /transports/:id/producers      {kind, rtpParameters}
//! POST   /transports/:id/consumers      {producerId, rtpCapabilities}
//! POST   /producers/:id/can-consume     {rtpCapabilities}
//! POST   /consumers/:id/pause | /resume
//! DELETE /transports/:id | /producers/:id | /consumers/:id
//! ```
//!
//! 404 maps to the matching `Unknown*` error, 422 to `CapabilityMismatch`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ConsumerParameters, EngineError, MediaEngine, ProducerCreated, TransportParameters};

/// Media engine adapter speaking JSON over HTTP to the SFU sidecar.
pub struct HttpMediaEngine {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CanConsumeReply {
    #[serde(rename = "canConsume")]
    can_consume: bool,
}

impl HttpMediaEngine {
    /// Create an adapter for the sidecar at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map an error response to the engine taxonomy. `not_found` supplies
    /// the `Unknown*` variant for 404s since the resource kind depends on
    /// the route.
    async fn check(
        response: reqwest::Response,
        not_found: impl FnOnce() -> EngineError,
    ) -> Result<reqwest::Response, EngineError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            404 => Err(not_found()),
            422 => {
                let body = response.text().await.unwrap_or_default();
                Err(EngineError::CapabilityMismatch(body))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(EngineError::Protocol(format!("status {status}: {body}")))
            }
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        not_found: impl FnOnce() -> EngineError,
    ) -> Result<reqwest::Response, EngineError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Self::check(response, not_found).await
    }

    async fn delete(&self, path: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        // DELETE on an already-gone resource is fine; close is idempotent.
        match response.status().as_u16() {
            200..=299 | 404 => Ok(()),
            status => Err(EngineError::Protocol(format!("status {status}"))),
        }
    }
}

#[async_trait]
impl MediaEngine for HttpMediaEngine {
    async fn router_capabilities(&self) -> Result<Value, EngineError> {
        let response = self
            .client
            .get(self.url("/router/rtp-capabilities"))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let response = Self::check(response, || {
            EngineError::Protocol("router capabilities missing".to_string())
        })
        .await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn create_transport(&self) -> Result<TransportParameters, EngineError> {
        let response = self
            .post_json("/transports", &json!({}), || {
                EngineError::Protocol("transport endpoint missing".to_string())
            })
            .await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        self.post_json(
            &format!("/transports/{transport_id}/connect"),
            &json!({ "dtlsParameters": dtls_parameters }),
            || EngineError::UnknownTransport(transport_id.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> Result<ProducerCreated, EngineError> {
        let response = self
            .post_json(
                &format!("/transports/{transport_id}/producers"),
                &json!({ "kind": kind, "rtpParameters": rtp_parameters }),
                || EngineError::UnknownTransport(transport_id.to_string()),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError> {
        let response = self
            .post_json(
                &format!("/producers/{producer_id}/can-consume"),
                &json!({ "rtpCapabilities": rtp_capabilities }),
                || EngineError::UnknownProducer(producer_id.to_string()),
            )
            .await?;
        let reply: CanConsumeReply = response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(reply.can_consume)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParameters, EngineError> {
        let response = self
            .post_json(
                &format!("/transports/{transport_id}/consumers"),
                &json!({ "producerId": producer_id, "rtpCapabilities": rtp_capabilities }),
                || EngineError::UnknownTransport(transport_id.to_string()),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.post_json(&format!("/consumers/{consumer_id}/pause"), &json!({}), || {
            EngineError::UnknownConsumer(consumer_id.to_string())
        })
        .await
        .map(|_| ())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.post_json(
            &format!("/consumers/{consumer_id}/resume"),
            &json!({}),
            || EngineError::UnknownConsumer(consumer_id.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.delete(&format!("/transports/{transport_id}")).await
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delete(&format!("/producers/{producer_id}")).await
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.delete(&format!("/consumers/{consumer_id}")).await
    }
}
