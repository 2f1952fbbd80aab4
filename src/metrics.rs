//! Metrics & Diagnostics (C12): read-only counters snapshot and a derived
//! health status with recommendations.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;

use crate::channel::ChannelPool;
use crate::forwarder::MeshForwarder;
use crate::robust::RobustLayer;
use crate::router::Router;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning(Vec<String>),
    Critical(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub decoded: u32,
    pub decode_errors: u32,
    pub guard_blocked: u32,
    pub dedup_dropped: u32,
    pub ttl_expired: u32,
    pub loop_dropped: u32,
    pub forwarded: u32,
    pub delivered_local: u32,
    pub no_route: u32,
    pub queue_len: usize,
    pub circuit_breaker_open: bool,
    pub channel_acquire_failures: u32,
    pub router_cache_hits: u32,
    pub router_cache_misses: u32,
    pub breaker_transitions: u32,
    pub failure_streaks_tripped: u32,
}

/// Computes a point-in-time snapshot from the forwarder's, robust layer's,
/// channel pool's, and router's single-writer counters. Never mutates
/// engine state: reads are plain atomic loads, so this never blocks the
/// hot path.
pub struct MetricsReporter {
    forwarder: Arc<MeshForwarder>,
    robust: Arc<RobustLayer>,
    channels: Arc<ChannelPool>,
    router: Arc<Router>,
}

impl MetricsReporter {
    pub fn new(forwarder: Arc<MeshForwarder>, robust: Arc<RobustLayer>, channels: Arc<ChannelPool>, router: Arc<Router>) -> Self {
        Self { forwarder, robust, channels, router }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.forwarder.counters;
        MetricsSnapshot {
            decoded: c.decoded.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            guard_blocked: c.guard_blocked.load(Ordering::Relaxed),
            dedup_dropped: c.dedup_dropped.load(Ordering::Relaxed),
            ttl_expired: c.ttl_expired.load(Ordering::Relaxed),
            loop_dropped: c.loop_dropped.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            delivered_local: c.delivered_local.load(Ordering::Relaxed),
            no_route: c.no_route.load(Ordering::Relaxed),
            queue_len: self.forwarder.queue_len(),
            circuit_breaker_open: self.robust.breaker_is_open(),
            channel_acquire_failures: self.channels.acquire_failures(),
            router_cache_hits: self.router.cache_hits(),
            router_cache_misses: self.router.cache_misses(),
            breaker_transitions: self.robust.breaker_transition_count(),
            failure_streaks_tripped: c.failure_streaks_tripped.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        let mut critical = Vec::new();
        let mut warnings = Vec::new();

        if snapshot.circuit_breaker_open {
            critical.push("circuit breaker is open; sends are failing fast".to_string());
        }
        if snapshot.decoded > 0 {
            let drop_ratio = (snapshot.decode_errors + snapshot.guard_blocked) as f64 / snapshot.decoded as f64;
            if drop_ratio > 0.5 {
                critical.push(format!("{:.0}% of inbound traffic is being dropped", drop_ratio * 100.0));
            } else if drop_ratio > 0.2 {
                warnings.push(format!("{:.0}% of inbound traffic is being dropped", drop_ratio * 100.0));
            }
        }
        if snapshot.no_route > 0 && snapshot.forwarded > 0 && snapshot.no_route > snapshot.forwarded {
            warnings.push("more sends are failing to find a route than are succeeding".to_string());
        }
        if snapshot.queue_len > 400 {
            warnings.push("forward queue is nearly at capacity".to_string());
        }
        if snapshot.channel_acquire_failures > 50 {
            warnings.push("channel pool is degraded; acquires are failing often".to_string());
        }
        let cache_total = snapshot.router_cache_hits + snapshot.router_cache_misses;
        if cache_total > 20 && snapshot.router_cache_misses as f64 / cache_total as f64 > 0.8 {
            warnings.push("emergency route cache is thrashing".to_string());
        }
        if snapshot.breaker_transitions > 10 {
            warnings.push("circuit breaker is flapping between states".to_string());
        }
        if snapshot.failure_streaks_tripped > 5 {
            warnings.push("multiple peers have tripped failure streaks".to_string());
        }

        if !critical.is_empty() {
            HealthStatus::Critical(critical)
        } else if !warnings.is_empty() {
            HealthStatus::Warning(warnings)
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelPool, ChannelPoolConfig};
    use crate::guard::FloodGuard;
    use crate::router::Router;
    use crate::security::test_double::NoopSecurityProvider;
    use crate::topology::Topology;
    use crate::transport::test_double::LoopbackTransport;
    use std::sync::Arc;

    fn build() -> MetricsReporter {
        let topology = Arc::new(Topology::new());
        let router = Arc::new(Router::new(topology.clone()));
        let channels = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
        let guard = Arc::new(FloodGuard::default());
        let security: Arc<dyn crate::security::SecurityProvider> = Arc::new(NoopSecurityProvider::new());
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(LoopbackTransport::new("local"));
        let optimizer = Arc::new(crate::optimizer::ConnectionOptimizer::new(30));
        let config = crate::config::EngineConfig::default();
        let forwarder = Arc::new(MeshForwarder::new(
            "local".into(),
            topology,
            router.clone(),
            channels.clone(),
            guard,
            security.clone(),
            transport.clone(),
            optimizer.clone(),
            &config,
        ));
        let robust = Arc::new(RobustLayer::new(channels.clone(), security, transport, optimizer));
        MetricsReporter::new(forwarder, robust, channels, router)
    }

    #[test]
    fn starts_healthy() {
        let reporter = build();
        assert_eq!(reporter.health(), HealthStatus::Healthy);
    }
}
