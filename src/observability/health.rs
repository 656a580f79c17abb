//! Health endpoints.
//!
//! Kubernetes-compatible probes:
//! - `GET /health` - liveness, plus current room/peer gauges
//! - `GET /ready` - readiness (false while starting up or draining)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::actors::CoordinatorMetrics;

/// Liveness/readiness flags.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
struct HealthRoutesState {
    health: Arc<HealthState>,
    metrics: Arc<CoordinatorMetrics>,
}

/// Router serving the probe endpoints.
pub fn health_router(health: Arc<HealthState>, metrics: Arc<CoordinatorMetrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(HealthRoutesState { health, metrics })
}

async fn health_handler(
    State(state): State<HealthRoutesState>,
) -> (StatusCode, Json<Value>) {
    let status = if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if state.health.is_live() { "ok" } else { "down" },
            "rooms": state.metrics.current_rooms(),
            "peers": state.metrics.current_peers(),
        })),
    )
}

async fn ready_handler(State(state): State<HealthRoutesState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let health = HealthState::new();
        assert!(health.is_live());
        assert!(!health.is_ready());
    }

    #[test]
    fn test_ready_toggles() {
        let health = HealthState::new();
        health.set_ready(true);
        assert!(health.is_ready());
        health.set_ready(false);
        assert!(!health.is_ready());
    }
}
