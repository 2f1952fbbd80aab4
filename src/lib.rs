//! An offline-capable peer-to-peer mesh messaging engine for short-range
//! radio swarms: channel pooling, flood/abuse protection, routing, and
//! forwarding over an injected [`Transport`] and [`SecurityProvider`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod guard;
pub mod metrics;
pub mod optimizer;
pub mod robust;
pub mod router;
pub mod security;
pub mod state;
pub mod topology;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

pub use config::EngineConfig;
pub use error::EngineError;
pub use frame::{FrameType, MeshFrame, PeerId};

use channel::{ChannelPool, ChannelPoolConfig};
use forwarder::MeshForwarder;
use guard::{FloodGuard, SecurityEvent};
use metrics::{HealthStatus, MetricsReporter, MetricsSnapshot};
use optimizer::ConnectionOptimizer;
use robust::{RobustLayer, SendOutcome};
use router::Router;
use security::SecurityProvider;
use state::{LayerState, StateCoordinator};
use topology::Topology;
use transport::Transport;

/// Generates a process-stable local peer id. Callers that need a specific
/// identity should supply it via their `Transport::local_id()`
/// implementation instead; this exists for environments that want to
/// mint an id before a transport is available.
pub fn generate_local_peer_id() -> PeerId {
    Uuid::new_v4().to_string()
}

/// Installs a `tracing` subscriber for test binaries, gated the same way
/// as the transport/security test doubles. Safe to call from every test;
/// only the first call takes effect.
#[cfg(any(test, feature = "test-util"))]
pub fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct BackgroundTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// The library's composition root. Owns `Arc`-shared handles to every
/// component (C2, C4, C6, C7, C8, C9, C10, C11, C12) and the injected
/// [`Transport`] (C1) / [`SecurityProvider`] (C3) collaborators.
pub struct MeshEngine {
    local_peer: PeerId,
    config: EngineConfig,
    channels: Arc<ChannelPool>,
    guard: Arc<FloodGuard>,
    topology: Arc<Topology>,
    router: Arc<Router>,
    forwarder: Arc<MeshForwarder>,
    robust: Arc<RobustLayer>,
    state: Arc<StateCoordinator>,
    optimizer: Arc<ConnectionOptimizer>,
    metrics: MetricsReporter,
    tasks: BackgroundTasks,
}

impl MeshEngine {
    pub async fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<Self, EngineError> {
        let local_peer = transport.local_id();
        info!(peer = %local_peer, "mesh engine starting");

        let topology = Arc::new(Topology::new());
        let router = Arc::new(Router::new(topology.clone()));
        let channels = Arc::new(ChannelPool::new(ChannelPoolConfig {
            max_concurrent_global: config.max_concurrent_global,
            channel_timeout: Duration::from_secs(config.channel_timeout_secs),
        }));
        let guard = Arc::new(FloodGuard::new(config.flood_protection.clone(), config.emergency_limits.clone()));
        let optimizer = Arc::new(ConnectionOptimizer::new(config.max_direct_peers as usize));
        let forwarder = Arc::new(MeshForwarder::new(
            local_peer.clone(),
            topology.clone(),
            router.clone(),
            channels.clone(),
            guard.clone(),
            security.clone(),
            transport.clone(),
            optimizer.clone(),
            &config,
        ));
        let robust = Arc::new(RobustLayer::new(channels.clone(), security.clone(), transport.clone(), optimizer.clone()));
        let state = Arc::new(StateCoordinator::new());
        let metrics = MetricsReporter::new(forwarder.clone(), robust.clone(), channels.clone(), router.clone());

        for peer in transport.connected_peers() {
            forwarder.peer_connected(peer.clone());
            optimizer.on_connect(&peer);
        }

        state.set_physical(LayerState::Ready);
        state.set_mesh(LayerState::Connecting);
        state.set_application(LayerState::Ready);

        let tasks = spawn_background_tasks(&config, forwarder.clone(), channels.clone(), state.clone());

        Ok(Self {
            local_peer,
            config,
            channels,
            guard,
            topology,
            router,
            forwarder,
            robust,
            state,
            optimizer,
            metrics,
            tasks,
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn on_frame_delivered<F>(&self, f: F)
    where
        F: Fn(&[u8], FrameType, &PeerId) + Send + Sync + 'static,
    {
        self.forwarder.on_frame_delivered(f);
    }

    pub fn on_emergency_frame<F>(&self, f: F)
    where
        F: Fn(&[u8], FrameType, &PeerId) + Send + Sync + 'static,
    {
        self.forwarder.on_emergency_frame(f);
    }

    pub fn on_topology_changed<F>(&self, f: F)
    where
        F: Fn(&std::collections::HashMap<PeerId, Vec<PeerId>>) + Send + Sync + 'static,
    {
        self.forwarder.on_topology_changed(f);
    }

    pub fn on_security_event<F>(&self, f: F)
    where
        F: Fn(SecurityEvent) + Send + Sync + 'static,
    {
        self.guard.on_security_event(f);
    }

    pub fn handle_peer_connected(&self, peer: PeerId) {
        self.forwarder.peer_connected(peer.clone());
        self.optimizer.on_connect(&peer);
    }

    pub fn handle_peer_disconnected(&self, peer: PeerId) {
        self.forwarder.peer_disconnected(peer.clone());
        self.optimizer.on_disconnect(&peer);
        self.router.mark_failed(&peer);
    }

    pub fn handle_data_received(&self, bytes: Vec<u8>, from: PeerId) {
        self.forwarder.handle_incoming(&bytes, &from);
    }

    /// Sends a payload to one or more peers through the Robust Layer
    /// (fan-out, retry, circuit breaker). For broadcast/queued traffic
    /// that should flow through the same dedup/priority path as forwarded
    /// frames, use [`MeshEngine::post`] instead.
    pub async fn send(
        &self,
        payload: Vec<u8>,
        frame_type: FrameType,
        peers: &[PeerId],
        timeout: Duration,
    ) -> SendOutcome {
        let frame = MeshFrame::new(frame_type, self.local_peer.clone(), None, payload);
        self.robust.robust_send(&frame, peers, timeout).await
    }

    /// Hands a message to the forwarder's own queue/routing pipeline.
    pub fn post(&self, payload: Vec<u8>, frame_type: FrameType, target: Option<PeerId>) {
        let frame = MeshFrame::new(frame_type, self.local_peer.clone(), target, payload);
        self.forwarder.enqueue_outbound(frame);
    }

    pub fn health(&self) -> HealthStatus {
        self.metrics.health()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            overall_state: self.state.overall(),
            can_send: self.state.can_send(),
            metrics: self.metrics.snapshot(),
            peer_count: self.topology.peer_count(),
        }
    }

    pub fn best_peers(&self, k: usize) -> Vec<PeerId> {
        self.optimizer.best_peers(k)
    }

    pub async fn shutdown(self) {
        self.tasks.shutdown.store(true, Ordering::SeqCst);
        for handle in self.tasks.handles {
            handle.abort();
        }
        info!(peer = %self.local_peer, "mesh engine shut down");
    }
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub overall_state: LayerState,
    pub can_send: bool,
    pub metrics: MetricsSnapshot,
    pub peer_count: usize,
}

fn spawn_background_tasks(
    config: &EngineConfig,
    forwarder: Arc<MeshForwarder>,
    channels: Arc<ChannelPool>,
    state: Arc<StateCoordinator>,
) -> BackgroundTasks {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    let tick_forwarder = forwarder.clone();
    let tick_shutdown = shutdown.clone();
    let tick_interval = Duration::from_millis(config.queue_tick_ms);
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        while !tick_shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            tick_forwarder.tick().await;
        }
    }));

    let heartbeat_forwarder = forwarder;
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_seconds as u64);
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        while !heartbeat_shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            heartbeat_forwarder.broadcast_heartbeat();
        }
    }));

    let maintenance_channels = channels;
    let maintenance_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        while !maintenance_shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            maintenance_channels.run_maintenance_tick();
        }
    }));

    let cleanup_shutdown = shutdown.clone();
    let cleanup_interval = Duration::from_secs(config.metrics_cleanup_secs);
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        while !cleanup_shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            // Eviction policies live on each component's own hot path
            // (dedup cache, content cache); this tick exists only to give
            // the state coordinator a periodic liveness beat.
            let _ = state.overall();
        }
    }));

    BackgroundTasks { handles, shutdown }
}

#[cfg(test)]
mod tests {
    use super::*;
    use security::test_double::NoopSecurityProvider;
    use transport::test_double::LoopbackTransport;

    async fn build_engine(local: &str) -> (MeshEngine, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new(local));
        let security = Arc::new(NoopSecurityProvider::new());
        let engine = MeshEngine::new(EngineConfig::default(), transport.clone(), security)
            .await
            .unwrap();
        (engine, transport)
    }

    #[tokio::test]
    async fn engine_constructs_and_reports_not_ready_initially() {
        let (engine, _transport) = build_engine("local").await;
        let snapshot = engine.snapshot();
        assert!(!snapshot.can_send);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn peer_connect_then_disconnect_leaves_no_channels() {
        let (engine, _transport) = build_engine("local").await;
        engine.handle_peer_connected("b".into());
        engine.handle_peer_disconnected("b".into());
        assert_eq!(engine.channels.channel_count(&"b".to_string()), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn delivered_frame_invokes_callback_exactly_once() {
        let (engine, _transport) = build_engine("c").await;
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = count.clone();
        engine.on_frame_delivered(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"hi".to_vec());
        let bytes = codec::encode(&frame).unwrap();
        engine.handle_data_received(bytes.clone(), "b".into());
        engine.handle_data_received(bytes, "b".into());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }
}
