//! WebSocket server and HTTP router assembly.
//!
//! Each accepted socket gets an unbounded outbound queue and a
//! [`Connection`] handler. A writer task drains the queue into the socket;
//! the reader loop parses frames and feeds the handler. Disconnect, clean
//! or not, runs the same teardown path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::handler::Connection;
use super::{ClientMessage, ServerEvent};
use crate::config::Config;
use crate::errors::CoordinatorError;
use crate::observability::{health_router, HealthState};
use crate::rest::rest_router;
use crate::AppState;

/// Assemble the full HTTP surface: signaling, REST, probes.
pub fn app_router(state: AppState, health: Arc<HealthState>) -> Router {
    let metrics = Arc::clone(&state.metrics);
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone())
        .merge(rest_router(state))
        .merge(health_router(health, metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut connection = Connection::new(state, outbound_tx);
    let connection_id = connection.connection_id().to_string();
    debug!(target: "ptt.server", connection_id, "Socket accepted");

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "ptt.server", error = %e, "Event serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(message) = decode_frame(&connection_id, &text) {
                    connection.handle_message(message).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
            Err(e) => {
                debug!(target: "ptt.server", connection_id, error = %e, "Socket error");
                break;
            }
        }
    }

    connection.on_disconnect().await;
    writer.abort();
    debug!(target: "ptt.server", connection_id, "Socket closed");
}

/// Parse one text frame. A malformed or incomplete frame is warn-logged
/// and ignored; it gets no reply and never closes the connection.
fn decode_frame(connection_id: &str, text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(target: "ptt.server", connection_id, error = %e, "Malformed frame ignored");
            None
        }
    }
}

/// Bind and serve until the root token is cancelled.
pub async fn serve(
    config: &Config,
    state: AppState,
    health: Arc<HealthState>,
    root_token: CancellationToken,
) -> Result<(), CoordinatorError> {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("bind {}: {e}", config.bind_address)))?;
    info!(target: "ptt.server", address = %config.bind_address, "Listening");

    let app = app_router(state, Arc::clone(&health));
    health.set_ready(true);

    let shutdown = async move { root_token.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("server error: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_frames_are_dropped_without_reply() {
        assert!(decode_frame("c1", "not json").is_none());
        // Missing payload for a variant that requires one.
        assert!(decode_frame("c1", r#"{"type":"join-room"}"#).is_none());
        assert!(decode_frame("c1", r#"{"type":"stop-speaking"}"#).is_some());
    }
}
