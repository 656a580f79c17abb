//! Coordinator error types.
//!
//! Error types map to signaling error replies and REST status codes.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

use crate::engine::EngineError;

/// Coordinator error type.
///
/// Maps to signaling replies / REST status codes:
/// - `AuthFailed`: `auth:error` / 401
/// - `NotAuthorized`: `join-error` / 403
/// - `NotSpeaker`: `speak-error`, no producer created
/// - `RoomNotFound`, `PeerNotFound`, `DirectoryNotFound`: 404
/// - `Conflict`: 409
/// - `Engine`, `StoreWrite`, `Internal`: 500
/// - `Draining`: 503
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Authentication failed (bad credentials or token).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Join without membership or across companies.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Produce attempted by a connection that does not hold the floor.
    #[error("not the current speaker")]
    NotSpeaker,

    /// Room not found (never joined or already destroyed).
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Peer session not found (disconnected or never registered).
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// A directory record is missing.
    #[error("{kind} not found: {id}")]
    DirectoryNotFound { kind: &'static str, id: String },

    /// Conflict (e.g. duplicate membership edge).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Media engine call failed.
    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    /// Persisting the directory snapshot failed. Fatal to that single
    /// write attempt only; in-memory state is unaffected.
    #[error("store write failed: {0}")]
    StoreWrite(String),

    /// Coordinator is shutting down.
    #[error("coordinator is draining")]
    Draining,

    /// Internal error (channel closed, actor gone).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Returns the HTTP status code for this error at the REST boundary.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::AuthFailed(_) => 401,
            CoordinatorError::NotAuthorized(_) | CoordinatorError::NotSpeaker => 403,
            CoordinatorError::RoomNotFound(_)
            | CoordinatorError::PeerNotFound(_)
            | CoordinatorError::DirectoryNotFound { .. } => 404,
            CoordinatorError::Conflict(_) => 409,
            CoordinatorError::Draining => 503,
            CoordinatorError::Engine(_)
            | CoordinatorError::StoreWrite(_)
            | CoordinatorError::Internal(_) => 500,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CoordinatorError::AuthFailed(_) => "Invalid credentials or token".to_string(),
            CoordinatorError::NotAuthorized(msg) => msg.clone(),
            CoordinatorError::NotSpeaker => "Not the current speaker".to_string(),
            CoordinatorError::RoomNotFound(_) => "Room not found".to_string(),
            CoordinatorError::PeerNotFound(_) => "Peer not found".to_string(),
            CoordinatorError::DirectoryNotFound { kind, .. } => format!("{kind} not found"),
            CoordinatorError::Conflict(msg) => msg.clone(),
            CoordinatorError::Draining => "Server is shutting down".to_string(),
            CoordinatorError::Engine(_)
            | CoordinatorError::StoreWrite(_)
            | CoordinatorError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            CoordinatorError::AuthFailed("bad token".to_string()).status_code(),
            401
        );
        assert_eq!(
            CoordinatorError::NotAuthorized("no membership".to_string()).status_code(),
            403
        );
        assert_eq!(CoordinatorError::NotSpeaker.status_code(), 403);
        assert_eq!(
            CoordinatorError::RoomNotFound("r1".to_string()).status_code(),
            404
        );
        assert_eq!(
            CoordinatorError::DirectoryNotFound {
                kind: "channel",
                id: "ch_1".to_string()
            }
            .status_code(),
            404
        );
        assert_eq!(
            CoordinatorError::Conflict("already a member".to_string()).status_code(),
            409
        );
        assert_eq!(CoordinatorError::Draining.status_code(), 503);
        assert_eq!(
            CoordinatorError::StoreWrite("disk full".to_string()).status_code(),
            500
        );
        assert_eq!(
            CoordinatorError::Internal("channel closed".to_string()).status_code(),
            500
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err = CoordinatorError::StoreWrite("/var/data/ptt/data.json: EIO".to_string());
        assert!(!store_err.client_message().contains("/var"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let auth_err = CoordinatorError::AuthFailed("signature mismatch for dev_abc".to_string());
        assert!(!auth_err.client_message().contains("dev_abc"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: CoordinatorError = EngineError::UnknownTransport("t1".to_string()).into();
        assert!(matches!(err, CoordinatorError::Engine(_)));
        assert_eq!(err.status_code(), 500);
    }
}
