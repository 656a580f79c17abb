//! Coordinator counters.
//!
//! Plain atomics shared between the actors and the health endpoint. Gauges
//! are derived from monotonic pairs so concurrent increments never race a
//! decrement below zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters for rooms, peers and arbitration outcomes.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    rooms_created: AtomicU64,
    rooms_destroyed: AtomicU64,
    peers_joined: AtomicU64,
    peers_left: AtomicU64,
    speak_grants: AtomicU64,
    speak_denials: AtomicU64,
    pages_sent: AtomicU64,
}

impl CoordinatorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_destroyed(&self) {
        self.rooms_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_joined(&self) {
        self.peers_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_left(&self) {
        self.peers_left.fetch_add(1, Ordering::Relaxed);
    }

    pub fn speak_granted(&self) {
        self.speak_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn speak_denied(&self) {
        self.speak_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_sent(&self) {
        self.pages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Rooms currently alive.
    #[must_use]
    pub fn current_rooms(&self) -> u64 {
        self.rooms_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.rooms_destroyed.load(Ordering::Relaxed))
    }

    /// Peers currently in rooms.
    #[must_use]
    pub fn current_peers(&self) -> u64 {
        self.peers_joined
            .load(Ordering::Relaxed)
            .saturating_sub(self.peers_left.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn total_speak_grants(&self) -> u64 {
        self.speak_grants.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_speak_denials(&self) -> u64 {
        self.speak_denials.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.pages_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_track_create_destroy_pairs() {
        let metrics = CoordinatorMetrics::new();
        metrics.room_created();
        metrics.room_created();
        metrics.room_destroyed();
        assert_eq!(metrics.current_rooms(), 1);

        metrics.peer_joined();
        metrics.peer_left();
        assert_eq!(metrics.current_peers(), 0);
    }

    #[test]
    fn test_gauges_never_underflow() {
        let metrics = CoordinatorMetrics::new();
        metrics.room_destroyed();
        assert_eq!(metrics.current_rooms(), 0);
    }
}
