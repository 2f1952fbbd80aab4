//! Mesh Forwarder (C8): dedup cache, priority queue, TTL/hop-count
//! enforcement, forwarding decisions, heartbeat, and routing updates.

mod queue;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::channel::{ChannelPool, Priority as ChannelPriority};
use crate::codec;
use crate::config::EngineConfig;
use crate::frame::{now_secs, FrameType, MeshFrame, PeerId};
use crate::guard::FloodGuard;
use crate::optimizer::ConnectionOptimizer;
use crate::router::Router;
use crate::security::SecurityProvider;
use crate::topology::Topology;
use crate::transport::Transport;

pub use queue::ForwardQueue;

const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
const FAILURE_THRESHOLD: u32 = 3;

struct DedupCache {
    order: VecDeque<[u8; 16]>,
    seen: HashSet<[u8; 16]>,
    cap: usize,
}

impl DedupCache {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    /// Returns true if `id` was already present (i.e. a duplicate).
    fn check_and_insert(&mut self, id: [u8; 16]) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        if self.order.len() >= self.cap {
            let evict = self.order.len() / 2;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        false
    }
}

#[derive(Default)]
struct FailureTracker {
    counters: HashMap<PeerId, VecDeque<Instant>>,
}

impl FailureTracker {
    fn record_failure(&mut self, peer: &PeerId, now: Instant) -> bool {
        let entry = self.counters.entry(peer.clone()).or_default();
        entry.push_back(now);
        while let Some(&front) = entry.front() {
            if now.duration_since(front) > FAILURE_WINDOW {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.len() as u32 >= FAILURE_THRESHOLD
    }

    fn record_success(&mut self, peer: &PeerId) {
        self.counters.remove(peer);
    }
}

pub type FrameObserver = Arc<dyn Fn(&[u8], FrameType, &PeerId) + Send + Sync>;
pub type TopologyObserver = Arc<dyn Fn(&HashMap<PeerId, Vec<PeerId>>) + Send + Sync>;

#[derive(Default)]
pub struct ForwarderCounters {
    pub decoded: AtomicU32,
    pub decode_errors: AtomicU32,
    pub guard_blocked: AtomicU32,
    pub dedup_dropped: AtomicU32,
    pub ttl_expired: AtomicU32,
    pub hop_limit_exceeded: AtomicU32,
    pub loop_dropped: AtomicU32,
    pub forwarded: AtomicU32,
    pub delivered_local: AtomicU32,
    pub no_route: AtomicU32,
    pub failure_streaks_tripped: AtomicU32,
}

pub struct MeshForwarder {
    local_peer: PeerId,
    topology: Arc<Topology>,
    router: Arc<Router>,
    channels: Arc<ChannelPool>,
    guard: Arc<FloodGuard>,
    security: Arc<dyn SecurityProvider>,
    transport: Arc<dyn Transport>,
    optimizer: Arc<ConnectionOptimizer>,
    max_hop_count: u8,
    message_ttl_secs: u32,

    dedup: Mutex<DedupCache>,
    queue: Mutex<ForwardQueue>,
    failures: Mutex<FailureTracker>,
    connected: RwLock<HashSet<PeerId>>,

    on_frame_delivered: Mutex<Vec<FrameObserver>>,
    on_emergency_frame: Mutex<Vec<FrameObserver>>,
    on_topology_changed: Mutex<Vec<TopologyObserver>>,

    pub counters: ForwarderCounters,
}

impl MeshForwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        topology: Arc<Topology>,
        router: Arc<Router>,
        channels: Arc<ChannelPool>,
        guard: Arc<FloodGuard>,
        security: Arc<dyn SecurityProvider>,
        transport: Arc<dyn Transport>,
        optimizer: Arc<ConnectionOptimizer>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            local_peer,
            topology,
            router,
            channels,
            guard,
            security,
            transport,
            optimizer,
            max_hop_count: config.max_hop_count,
            message_ttl_secs: config.message_ttl_seconds,
            dedup: Mutex::new(DedupCache::new(config.dedup_cache_cap)),
            queue: Mutex::new(ForwardQueue::new(config.normal_queue_cap, config.emergency_queue_cap)),
            failures: Mutex::new(FailureTracker::default()),
            connected: RwLock::new(HashSet::new()),
            on_frame_delivered: Mutex::new(Vec::new()),
            on_emergency_frame: Mutex::new(Vec::new()),
            on_topology_changed: Mutex::new(Vec::new()),
            counters: ForwarderCounters::default(),
        }
    }

    pub fn on_frame_delivered<F>(&self, f: F)
    where
        F: Fn(&[u8], FrameType, &PeerId) + Send + Sync + 'static,
    {
        self.on_frame_delivered.lock().push(Arc::new(f));
    }

    pub fn on_emergency_frame<F>(&self, f: F)
    where
        F: Fn(&[u8], FrameType, &PeerId) + Send + Sync + 'static,
    {
        self.on_emergency_frame.lock().push(Arc::new(f));
    }

    pub fn on_topology_changed<F>(&self, f: F)
    where
        F: Fn(&HashMap<PeerId, Vec<PeerId>>) + Send + Sync + 'static,
    {
        self.on_topology_changed.lock().push(Arc::new(f));
    }

    pub fn peer_connected(&self, peer: PeerId) {
        self.channels.on_peer_connected(&peer);
        self.connected.write().insert(peer.clone());
        self.broadcast_routing_update();
    }

    pub fn peer_disconnected(&self, peer: PeerId) {
        self.channels.on_peer_disconnected(&peer);
        self.connected.write().remove(&peer);
        self.topology.remove_peer(&peer);
        self.broadcast_routing_update();
    }

    /// The inbound path: decrypt, decode, guard, dedup, topology update,
    /// local delivery, forward scheduling.
    pub fn handle_incoming(&self, raw_bytes: &[u8], from_peer: &PeerId) {
        let plaintext = if self.security.has_session_key(from_peer) {
            match self.security.decrypt(raw_bytes, from_peer) {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        } else {
            raw_bytes.to_vec()
        };

        let frame = match codec::decode(&plaintext) {
            Ok(f) => f,
            Err(_) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.counters.decoded.fetch_add(1, Ordering::Relaxed);

        // `should_block` itself branches on `bypasses_guard` to skip the
        // rate/content checks for emergency and system traffic; the ban
        // check always applies regardless of frame type.
        if self.guard.should_block(&frame, from_peer) {
            self.counters.guard_blocked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.dedup.lock().check_and_insert(frame.id) {
            self.counters.dedup_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match frame.frame_type {
            FrameType::Heartbeat => {
                self.topology.add_edge(&frame.source_id, from_peer);
                self.router.update_metrics(from_peer, -60.0, 0.0);
            }
            FrameType::RoutingUpdate => {
                if let Ok(neighbors) = serde_json::from_slice::<Vec<PeerId>>(&frame.payload) {
                    self.topology.merge_adjacency(&frame.source_id, &neighbors);
                    self.notify_topology_changed();
                }
            }
            _ => {}
        }

        let is_local_target = frame.target_id.as_ref().map_or(true, |t| t == &self.local_peer);
        if is_local_target {
            self.deliver_locally(&frame);
        }

        self.consider_forwarding(frame);
    }

    fn deliver_locally(&self, frame: &MeshFrame) {
        self.counters.delivered_local.fetch_add(1, Ordering::Relaxed);
        if frame.frame_type.is_emergency() {
            for cb in self.on_emergency_frame.lock().iter() {
                cb(&frame.payload, frame.frame_type, &frame.source_id);
            }
        }
        for cb in self.on_frame_delivered.lock().iter() {
            cb(&frame.payload, frame.frame_type, &frame.source_id);
        }
    }

    fn consider_forwarding(&self, frame: MeshFrame) {
        let now = now_secs();
        if frame.ttl == 0 || frame.is_expired_within(now, self.message_ttl_secs) {
            self.counters.ttl_expired.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if frame.hop_count >= self.max_hop_count {
            self.counters.hop_limit_exceeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if frame.route_path.contains(&self.local_peer) {
            self.counters.loop_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if frame.target_id.is_some() && frame.target_id.as_ref() != Some(&self.local_peer) {
            let forwarded = frame.prepare_forward(&self.local_peer);
            self.queue.lock().enqueue(forwarded);
        } else if frame.target_id.is_none() {
            let forwarded = frame.prepare_forward(&self.local_peer);
            self.queue.lock().enqueue(forwarded);
        }
    }

    pub fn enqueue_outbound(&self, frame: MeshFrame) {
        self.queue.lock().enqueue(frame);
    }

    /// Runs one outbound queue tick: dequeues the next frame and routes or
    /// broadcasts it.
    pub async fn tick(&self) {
        let Some(frame) = self.queue.lock().dequeue() else { return };

        if let Some(target) = frame.target_id.clone() {
            if self.connected.read().contains(&target) {
                self.send_to_peer(&frame, &target).await;
            } else if let Some(path) = self.router.find_best_route(&self.local_peer, &target, frame.frame_type.is_emergency()) {
                if let Some(next_hop) = path.get(1) {
                    self.send_to_peer(&frame, next_hop).await;
                } else {
                    self.counters.no_route.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                self.counters.no_route.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            let targets: Vec<PeerId> = self
                .connected
                .read()
                .iter()
                .filter(|p| !frame.route_path.contains(p))
                .cloned()
                .collect();
            for peer in targets {
                self.send_to_peer(&frame, &peer).await;
            }
        }
    }

    async fn send_to_peer(&self, frame: &MeshFrame, peer: &PeerId) {
        let Ok(handle) = self.channels.acquire(peer, priority_for(frame)).await else {
            self.record_failure(peer);
            return;
        };

        let encoded = match codec::encode(frame) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.channels.release(handle, false, 0);
                return;
            }
        };

        let to_send = if self.security.has_session_key(peer) {
            self.security.encrypt(&encoded, peer).unwrap_or(encoded)
        } else {
            encoded
        };

        let len = to_send.len();
        let started = Instant::now();
        let result = self.transport.send(to_send, std::slice::from_ref(peer)).await;
        let success = result.is_ok();
        self.channels.release(handle, success, len);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.optimizer.record_send_result(peer, success, elapsed_ms, len);

        if success {
            self.failures.lock().record_success(peer);
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_failure(peer);
        }
        trace!(peer = %peer, success, elapsed_ms = elapsed_ms as u64, "forwarder send attempt");
    }

    fn record_failure(&self, peer: &PeerId) {
        let tripped = self.failures.lock().record_failure(peer, Instant::now());
        if tripped {
            self.router.mark_failed(peer);
            self.counters.failure_streaks_tripped.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %peer, "forwarder: marking peer failed after repeated send failures");
        }
    }

    pub fn broadcast_heartbeat(&self) {
        let neighbor_count = self.connected.read().len();
        if neighbor_count == 0 {
            return;
        }
        let payload = format!("{}:{}", self.local_peer, neighbor_count).into_bytes();
        let frame = MeshFrame::new(FrameType::Heartbeat, self.local_peer.clone(), None, payload);
        self.queue.lock().enqueue(frame);
    }

    pub fn broadcast_routing_update(&self) {
        let neighbors = self.topology.neighbors(&self.local_peer);
        let Ok(payload) = serde_json::to_vec(&neighbors) else { return };
        let frame = MeshFrame::new(FrameType::RoutingUpdate, self.local_peer.clone(), None, payload);
        self.queue.lock().enqueue(frame);
    }

    fn notify_topology_changed(&self) {
        let mut snapshot = HashMap::new();
        for peer in self.connected.read().iter() {
            snapshot.insert(peer.clone(), self.topology.neighbors(peer));
        }
        for cb in self.on_topology_changed.lock().iter() {
            cb(&snapshot);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

fn priority_for(frame: &MeshFrame) -> ChannelPriority {
    if frame.frame_type.is_emergency() {
        ChannelPriority::Emergency
    } else {
        ChannelPriority::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPoolConfig;
    use crate::security::test_double::NoopSecurityProvider;
    use crate::transport::test_double::LoopbackTransport;

    fn build(local: &str) -> (Arc<MeshForwarder>, Arc<LoopbackTransport>) {
        let topology = Arc::new(Topology::new());
        let router = Arc::new(Router::new(topology.clone()));
        let channels = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
        let guard = Arc::new(FloodGuard::default());
        let security: Arc<dyn SecurityProvider> = Arc::new(NoopSecurityProvider::new());
        let transport = Arc::new(LoopbackTransport::new(local));
        let optimizer = Arc::new(ConnectionOptimizer::new(30));
        let config = EngineConfig::default();
        let forwarder = Arc::new(MeshForwarder::new(
            local.to_string(),
            topology,
            router,
            channels,
            guard,
            security,
            transport.clone(),
            optimizer,
            &config,
        ));
        (forwarder, transport)
    }

    #[tokio::test]
    async fn duplicate_frames_are_delivered_at_most_once() {
        let (forwarder, _transport) = build("c");
        let delivered = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = delivered.clone();
        forwarder.on_frame_delivered(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"hi".to_vec());
        let encoded = codec::encode(&frame).unwrap();

        forwarder.handle_incoming(&encoded, &"b".to_string());
        forwarder.handle_incoming(&encoded, &"b".to_string());

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frame_containing_local_peer_in_path_is_not_forwarded() {
        let (forwarder, _transport) = build("b");
        let mut frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"hi".to_vec());
        frame.route_path.push("b".into());
        let encoded = codec::encode(&frame).unwrap();
        forwarder.handle_incoming(&encoded, &"a".to_string());
        assert_eq!(forwarder.queue_len(), 0);
    }

    #[tokio::test]
    async fn ttl_zero_is_dropped_not_forwarded() {
        let (forwarder, _transport) = build("b");
        let mut frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"hi".to_vec());
        frame.ttl = 0;
        let encoded = codec::encode(&frame).unwrap();
        forwarder.handle_incoming(&encoded, &"a".to_string());
        assert_eq!(forwarder.queue_len(), 0);
    }

    #[tokio::test]
    async fn heartbeat_updates_topology_adjacency() {
        let (forwarder, _transport) = build("c");
        let frame = MeshFrame::new(FrameType::Heartbeat, "a".into(), None, b"a:1".to_vec());
        let encoded = codec::encode(&frame).unwrap();
        forwarder.handle_incoming(&encoded, &"b".to_string());
        assert!(forwarder.topology.neighbors(&"a".to_string()).contains(&"b".to_string()));
    }
}
