//! Connection Optimizer (C11): per-peer quality tracking, admission
//! control, and best-peer selection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::frame::PeerId;

const STABLE_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct ConnectionQuality {
    pub latency_ms: f64,
    pub packet_loss: f64,
    pub bandwidth_bps: f64,
    pub is_stable: bool,
    connected_since: Instant,
    last_update: Instant,
}

impl ConnectionQuality {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            latency_ms: 100.0,
            packet_loss: 0.0,
            bandwidth_bps: 512.0,
            is_stable: false,
            connected_since: now,
            last_update: now,
        }
    }

    fn record_success(&mut self, observed_latency_ms: f64, bytes: usize) {
        self.latency_ms = 0.7 * self.latency_ms + 0.3 * observed_latency_ms;
        let instantaneous_bw = if observed_latency_ms > 0.0 {
            bytes as f64 / (observed_latency_ms / 1000.0)
        } else {
            bytes as f64
        };
        self.bandwidth_bps = 0.8 * self.bandwidth_bps + 0.2 * instantaneous_bw;
        self.packet_loss *= 0.9;
        self.last_update = Instant::now();
        self.refresh_stability();
    }

    fn record_failure(&mut self) {
        self.packet_loss = (self.packet_loss + 0.1).min(1.0);
        self.bandwidth_bps *= 0.9;
        self.is_stable = self.packet_loss < 0.3;
        self.last_update = Instant::now();
    }

    fn refresh_stability(&mut self) {
        if !self.is_stable && self.connected_since.elapsed() >= STABLE_AFTER {
            self.is_stable = true;
        }
    }

    fn score(&self) -> f64 {
        let latency_norm = (self.latency_ms / 1000.0).min(1.0);
        let bw_norm = (self.bandwidth_bps / 10_000.0).min(1.0);
        ((1.0 - latency_norm) + (1.0 - self.packet_loss) + bw_norm) / 3.0
    }
}

pub struct ConnectionOptimizer {
    peers: RwLock<HashMap<PeerId, ConnectionQuality>>,
    max_connections: usize,
}

impl ConnectionOptimizer {
    pub fn new(max_connections: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn on_connect(&self, peer: &PeerId) {
        self.peers.write().entry(peer.clone()).or_insert_with(ConnectionQuality::new);
    }

    pub fn on_disconnect(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    pub fn record_send_result(&self, peer: &PeerId, success: bool, observed_latency_ms: f64, bytes: usize) {
        let mut peers = self.peers.write();
        if let Some(quality) = peers.get_mut(peer) {
            if success {
                quality.record_success(observed_latency_ms, bytes);
            } else {
                quality.record_failure();
            }
        }
    }

    /// Admission control: reject a new connection when the stable-peer
    /// count is already at the cap.
    pub fn admit_new_connection(&self) -> bool {
        let stable_count = self.peers.read().values().filter(|q| q.is_stable).count();
        stable_count < self.max_connections
    }

    pub fn best_peers(&self, k: usize) -> Vec<PeerId> {
        let peers = self.peers.read();
        let mut scored: Vec<(PeerId, f64)> = peers.iter().map(|(id, q)| (id.clone(), q.score())).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    pub fn quality_of(&self, peer: &PeerId) -> Option<ConnectionQuality> {
        self.peers.read().get(peer).cloned()
    }
}

impl Clone for ConnectionQuality {
    fn clone(&self) -> Self {
        Self {
            latency_ms: self.latency_ms,
            packet_loss: self.packet_loss,
            bandwidth_bps: self.bandwidth_bps,
            is_stable: self.is_stable,
            connected_since: self.connected_since,
            last_update: self.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_values_match_documented_defaults() {
        let opt = ConnectionOptimizer::new(30);
        opt.on_connect(&"p".to_string());
        let q = opt.quality_of(&"p".to_string()).unwrap();
        assert_eq!(q.latency_ms, 100.0);
        assert_eq!(q.bandwidth_bps, 512.0);
        assert!(!q.is_stable);
    }

    #[test]
    fn admission_rejects_once_at_cap() {
        let opt = ConnectionOptimizer::new(1);
        opt.on_connect(&"a".to_string());
        // Force stability without waiting on the real clock.
        opt.peers.write().get_mut("a").unwrap().is_stable = true;
        assert!(!opt.admit_new_connection());
    }

    #[test]
    fn failed_send_increases_loss_and_may_flip_unstable() {
        let opt = ConnectionOptimizer::new(30);
        opt.on_connect(&"p".to_string());
        for _ in 0..5 {
            opt.record_send_result(&"p".to_string(), false, 0.0, 0);
        }
        let q = opt.quality_of(&"p".to_string()).unwrap();
        assert!(!q.is_stable);
    }
}
