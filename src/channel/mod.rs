//! Channel Pool (C2): tracks logical channels per peer, their quality, and
//! admits sends under a global concurrency cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::frame::PeerId;

const QUALITY_ALPHA: f64 = 0.3;
const MAX_ACTIVE_PER_CHANNEL: u32 = 5;
const MAX_CHANNELS_PER_PEER: usize = 3;
const ACQUIRE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Active,
    Congested,
    Failed,
    Recovering,
    Maintenance,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelQuality {
    pub reliability: f64,
    pub throughput: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub congestion_level: f64,
}

impl Default for ChannelQuality {
    fn default() -> Self {
        Self {
            reliability: 1.0,
            throughput: 0.0,
            latency_ms: 0.0,
            error_rate: 0.0,
            congestion_level: 0.0,
        }
    }
}

impl ChannelQuality {
    fn ewma(prev: f64, sample: f64) -> f64 {
        QUALITY_ALPHA * sample + (1.0 - QUALITY_ALPHA) * prev
    }

    fn record(&mut self, success: bool, latency_ms: f64, throughput_sample: f64) {
        self.reliability = Self::ewma(self.reliability, if success { 1.0 } else { 0.0 });
        self.error_rate = Self::ewma(self.error_rate, if success { 0.0 } else { 1.0 });
        self.latency_ms = Self::ewma(self.latency_ms, latency_ms);
        self.throughput = Self::ewma(self.throughput, throughput_sample);
    }

    /// `0.4*reliability + 0.25*normalized_throughput + 0.2*(1-latency_norm) + 0.15*(1-error_rate)`
    pub fn overall_score(&self) -> f64 {
        let throughput_norm = (self.throughput / 10_000.0).min(1.0);
        let latency_norm = (self.latency_ms / 1000.0).min(1.0);
        0.4 * self.reliability + 0.25 * throughput_norm + 0.2 * (1.0 - latency_norm) + 0.15 * (1.0 - self.error_rate)
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_score() > 0.6 && self.reliability > 0.7 && self.error_rate < 0.3
    }

    pub fn needs_maintenance(&self, failure_count: u32, recovery_attempts: u32) -> bool {
        self.overall_score() < 0.4 || failure_count > 5 || recovery_attempts >= 3
    }
}

#[derive(Debug)]
pub struct Channel {
    pub id: String,
    pub peer_id: PeerId,
    pub state: ChannelState,
    pub quality: ChannelQuality,
    pub total_ops: u64,
    pub successful_ops: u64,
    pub failed_ops: u64,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub active_operations: u32,
    pub last_activity: Instant,
}

impl Channel {
    fn new(peer_id: PeerId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer_id,
            state: ChannelState::Idle,
            quality: ChannelQuality::default(),
            total_ops: 0,
            successful_ops: 0,
            failed_ops: 0,
            failure_count: 0,
            recovery_attempts: 0,
            active_operations: 0,
            last_activity: Instant::now(),
        }
    }

    /// Re-evaluates state per the transition table; called after every
    /// release and from the maintenance tick.
    fn retransition(&mut self, channel_timeout: Duration) {
        let needs_maintenance = self
            .quality
            .needs_maintenance(self.failure_count, self.recovery_attempts);

        if needs_maintenance {
            self.state = ChannelState::Maintenance;
        } else if self.quality.congestion_level > 0.8 {
            self.state = ChannelState::Congested;
        } else if !self.quality.is_healthy() {
            self.state = ChannelState::Recovering;
        } else if matches!(self.state, ChannelState::Idle | ChannelState::Recovering) && self.active_operations > 0 {
            self.state = ChannelState::Active;
        } else if matches!(self.state, ChannelState::Active) && self.active_operations == 0 {
            self.state = ChannelState::Idle;
        }

        if self.last_activity.elapsed() > channel_timeout || self.recovery_attempts >= 3 {
            self.state = ChannelState::Failed;
        }
    }

    fn run_maintenance_pass(&mut self) {
        if matches!(self.state, ChannelState::Recovering) {
            self.failure_count = 0;
            self.recovery_attempts = 0;
            self.state = ChannelState::Idle;
        }
    }
}

pub struct ChannelPoolConfig {
    pub max_concurrent_global: usize,
    pub channel_timeout: Duration,
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 20,
            channel_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Emergency,
    Normal,
}

/// Owns the channel table. `acquire`/`release` are the only mutators and
/// are serialized behind a single-writer lock; everything else only reads.
pub struct ChannelPool {
    channels: RwLock<HashMap<PeerId, Vec<Channel>>>,
    semaphore: Semaphore,
    config: ChannelPoolConfig,
    active_global: AtomicU32,
    acquire_failures: AtomicU32,
}

/// An acquired handle; callers must call [`ChannelPool::release`] exactly
/// once per successful acquire.
pub struct AcquiredChannel {
    pub peer_id: PeerId,
    pub channel_id: String,
    acquired_at: Instant,
}

impl ChannelPool {
    pub fn new(config: ChannelPoolConfig) -> Self {
        let max = config.max_concurrent_global;
        Self {
            channels: RwLock::new(HashMap::new()),
            semaphore: Semaphore::new(max),
            config,
            active_global: AtomicU32::new(0),
            acquire_failures: AtomicU32::new(0),
        }
    }

    pub fn on_peer_connected(&self, peer: &PeerId) {
        let mut table = self.channels.write();
        let entry = table.entry(peer.clone()).or_default();
        if entry.is_empty() {
            entry.push(Channel::new(peer.clone()));
            debug!(peer = %peer, "channel created for newly connected peer");
        }
    }

    pub fn on_peer_disconnected(&self, peer: &PeerId) {
        let mut table = self.channels.write();
        if table.remove(peer).is_some() {
            debug!(peer = %peer, "channels removed for disconnected peer");
        }
    }

    pub async fn acquire(&self, peer: &PeerId, priority: Priority) -> Result<AcquiredChannel, ChannelError> {
        let permit = match tokio::time::timeout(ACQUIRE_WAIT, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ChannelError::Unavailable(peer.clone()));
            }
            Err(_) => {
                self.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ChannelError::Timeout(peer.clone()));
            }
        };
        permit.forget();
        self.active_global.fetch_add(1, Ordering::SeqCst);

        let mut table = self.channels.write();
        let Some(channels) = table.get_mut(peer) else {
            self.release_permit();
            self.acquire_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::Unavailable(peer.clone()));
        };

        let candidate = channels
            .iter_mut()
            .filter(|c| c.state != ChannelState::Failed && c.active_operations < MAX_ACTIVE_PER_CHANNEL)
            .max_by(|a, b| {
                let (ka, kb) = match priority {
                    Priority::Emergency => (a.quality.reliability, b.quality.reliability),
                    Priority::Normal => (a.quality.overall_score(), b.quality.overall_score()),
                };
                ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
            });

        match candidate {
            Some(channel) => {
                channel.active_operations += 1;
                channel.last_activity = Instant::now();
                channel.retransition(self.config.channel_timeout);
                let handle = AcquiredChannel {
                    peer_id: peer.clone(),
                    channel_id: channel.id.clone(),
                    acquired_at: Instant::now(),
                };
                trace!(peer = %peer, channel = %handle.channel_id, "channel acquired");
                Ok(handle)
            }
            None => {
                self.release_permit();
                self.acquire_failures.fetch_add(1, Ordering::Relaxed);
                Err(ChannelError::Unavailable(peer.clone()))
            }
        }
    }

    pub fn acquire_failures(&self) -> u32 {
        self.acquire_failures.load(Ordering::Relaxed)
    }

    /// Peer with the highest share of currently-active operations across
    /// the whole pool, and that share as a fraction of all active
    /// operations. `None` when nothing is in flight.
    pub fn contention_ratio(&self) -> Option<(PeerId, f64)> {
        let table = self.channels.read();
        let mut per_peer: HashMap<&PeerId, u32> = HashMap::new();
        let mut total = 0u32;
        for (peer, channels) in table.iter() {
            let active: u32 = channels.iter().map(|c| c.active_operations).sum();
            total += active;
            if active > 0 {
                per_peer.insert(peer, active);
            }
        }
        if total == 0 {
            return None;
        }
        per_peer
            .into_iter()
            .max_by_key(|(_, active)| *active)
            .map(|(peer, active)| (peer.clone(), active as f64 / total as f64))
    }

    pub fn release(&self, handle: AcquiredChannel, success: bool, bytes: usize) {
        let latency_ms = handle.acquired_at.elapsed().as_secs_f64() * 1000.0;
        let throughput_sample = if latency_ms > 0.0 { bytes as f64 / (latency_ms / 1000.0) } else { bytes as f64 };

        let mut table = self.channels.write();
        if let Some(channels) = table.get_mut(&handle.peer_id) {
            if let Some(channel) = channels.iter_mut().find(|c| c.id == handle.channel_id) {
                channel.active_operations = channel.active_operations.saturating_sub(1);
                channel.total_ops += 1;
                if success {
                    channel.successful_ops += 1;
                } else {
                    channel.failed_ops += 1;
                    channel.failure_count += 1;
                }
                channel.quality.record(success, latency_ms, throughput_sample);
                channel.last_activity = Instant::now();
                channel.retransition(self.config.channel_timeout);
            }
        }
        drop(table);
        self.release_permit();
    }

    fn release_permit(&self) {
        self.semaphore.add_permits(1);
        self.active_global.fetch_sub(1, Ordering::SeqCst);
    }

    /// Keeps the top-3 channels by reliability per peer as "emergency
    /// reserved"; marks the rest recovering and bumps their recovery count.
    pub fn emergency_reset(&self) {
        let mut table = self.channels.write();
        for channels in table.values_mut() {
            let mut sorted: Vec<usize> = (0..channels.len()).collect();
            sorted.sort_by(|&a, &b| {
                channels[b]
                    .quality
                    .reliability
                    .partial_cmp(&channels[a].quality.reliability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for (rank, idx) in sorted.into_iter().enumerate() {
                if rank >= MAX_CHANNELS_PER_PEER.min(3) {
                    let c = &mut channels[idx];
                    c.state = ChannelState::Recovering;
                    c.recovery_attempts += 1;
                }
            }
        }
        warn!("emergency reset applied to channel pool");
    }

    /// Runs the periodic maintenance tick: re-evaluates transitions and
    /// clears `Recovering` channels whose failure counters have settled.
    pub fn run_maintenance_tick(&self) {
        let mut table = self.channels.write();
        for channels in table.values_mut() {
            for channel in channels.iter_mut() {
                channel.retransition(self.config.channel_timeout);
                channel.run_maintenance_pass();
            }
        }
    }

    pub fn channel_count(&self, peer: &PeerId) -> usize {
        self.channels.read().get(peer).map_or(0, Vec::len)
    }

    pub fn best_score(&self, peer: &PeerId) -> Option<f64> {
        self.channels
            .read()
            .get(peer)?
            .iter()
            .map(|c| c.quality.overall_score())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let peer: PeerId = "p1".into();
        pool.on_peer_connected(&peer);
        pool.on_peer_connected(&peer);
        assert_eq!(pool.channel_count(&peer), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_all_channels() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let peer: PeerId = "p1".into();
        pool.on_peer_connected(&peer);
        pool.on_peer_disconnected(&peer);
        assert_eq!(pool.channel_count(&peer), 0);
    }

    #[tokio::test]
    async fn acquire_then_release_updates_quality() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let peer: PeerId = "p1".into();
        pool.on_peer_connected(&peer);
        let handle = pool.acquire(&peer, Priority::Normal).await.unwrap();
        pool.release(handle, true, 128);
        assert!(pool.best_score(&peer).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn acquire_fails_for_unknown_peer() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let result = pool.acquire(&"ghost".to_string(), Priority::Normal).await;
        assert!(matches!(result, Err(ChannelError::Unavailable(_))));
    }
}
